//! Message routing: which agent handles an incoming message, and how a
//! team-chain response is parsed for handoffs and formatted once the chain
//! ends.

use regex::Regex;

use crate::{
    config::{Registry, TeamConfig},
    domain::{AgentId, TeamId},
};

/// Deliberately distinctive placeholder: the literal text isn't specified
/// upstream, so any implementation choosing one fresh counts.
pub const ROUTING_ERROR_TEXT: &str =
    "Pick a lane — I can't be on two teams' payroll at once. Mention one agent at a time.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedMessage {
    pub agent_id: AgentId,
    pub message: String,
    pub team: Option<TeamId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed(RoutedMessage),
    /// Two or more `!agent` mentions resolved to agents in different teams.
    RoutingError,
}

/// Apply the ordered routing rules (§4.2) to one incoming message.
pub fn route(raw_message: &str, message_agent: Option<&AgentId>, registry: &Registry) -> RouteOutcome {
    if has_multi_team_mention(raw_message, registry) {
        return RouteOutcome::RoutingError;
    }

    if let Some(agent_id) = message_agent {
        if registry.find_agent(agent_id).is_some() {
            return RouteOutcome::Routed(routed(agent_id.clone(), raw_message.to_string(), registry));
        }
    }

    if let Some((token, body)) = split_bang_prefix(raw_message) {
        if let Some(agent) = registry.find_agent_by_name_or_id(token) {
            let agent_id = AgentId(agent.id.clone());
            return RouteOutcome::Routed(routed(agent_id, body, registry));
        }
        if let Some(team) = registry.find_team(token) {
            let leader = AgentId(team.leader_agent.clone());
            let team_id = registry.team_id_of(team);
            return RouteOutcome::Routed(RoutedMessage {
                agent_id: leader,
                message: body,
                team: Some(team_id),
            });
        }
    }

    if let Some(default) = registry.default_agent() {
        return RouteOutcome::Routed(routed(default, raw_message.to_string(), registry));
    }

    RouteOutcome::RoutingError
}

fn routed(agent_id: AgentId, message: String, registry: &Registry) -> RoutedMessage {
    let team = registry.team_of(&agent_id).map(|t| registry.team_id_of(t));
    RoutedMessage {
        agent_id,
        message,
        team,
    }
}

fn split_bang_prefix(raw: &str) -> Option<(&str, String)> {
    let rest = raw.strip_prefix('!')?;
    let space_idx = rest.find(' ')?;
    let token = &rest[..space_idx];
    if token.is_empty() {
        return None;
    }
    Some((token, rest[space_idx + 1..].to_string()))
}

fn has_multi_team_mention(raw: &str, registry: &Registry) -> bool {
    let mut distinct_agents: Vec<AgentId> = Vec::new();
    for token in raw.split_whitespace() {
        let Some(word) = token.strip_prefix('!') else {
            continue;
        };
        if let Some(agent) = registry.find_agent_by_name_or_id(word) {
            let id = AgentId(agent.id.clone());
            if !distinct_agents.contains(&id) {
                distinct_agents.push(id);
            }
        }
    }
    if distinct_agents.len() < 2 {
        return false;
    }
    let teams: Vec<Option<TeamId>> = distinct_agents
        .iter()
        .map(|a| registry.team_of(a).map(|t| registry.team_id_of(t)))
        .collect();
    let first = &teams[0];
    teams.iter().any(|t| t != first)
}

/// A parsed teammate handoff, extracted from an agent's response text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mention {
    pub teammate_id: AgentId,
    pub handoff: String,
}

/// Parse teammate mentions out of `response`, preferring the explicit tag
/// form `[@id: text]` over the bare `@id` form, and keeping only mentions
/// naming a known agent that belongs to `team` and isn't `current_agent`.
pub fn parse_team_mentions(
    response: &str,
    team: &TeamConfig,
    current_agent: &AgentId,
    registry: &Registry,
) -> Vec<Mention> {
    let tag_re = Regex::new(r"\[@([A-Za-z0-9_\-]+):\s*([^\]]*)\]").expect("valid regex");
    let mut mentions = Vec::new();
    for cap in tag_re.captures_iter(response) {
        let id = AgentId(cap[1].to_string());
        if is_valid_teammate(&id, team, current_agent, registry) {
            mentions.push(Mention {
                teammate_id: id,
                handoff: cap[2].trim().to_string(),
            });
        }
    }
    if !mentions.is_empty() {
        return mentions;
    }

    let bare_re = Regex::new(r"@([A-Za-z0-9_\-]+)").expect("valid regex");
    if let Some(cap) = bare_re.captures(response) {
        let id = AgentId(cap[1].to_string());
        if is_valid_teammate(&id, team, current_agent, registry) {
            let rest_start = cap.get(0).expect("group 0 always matches").end();
            return vec![Mention {
                teammate_id: id,
                handoff: response[rest_start..].trim().to_string(),
            }];
        }
    }

    Vec::new()
}

fn is_valid_teammate(id: &AgentId, team: &TeamConfig, current: &AgentId, registry: &Registry) -> bool {
    id != current && team.agents.iter().any(|a| a == &id.0) && registry.find_agent(id).is_some()
}

/// Format the `[Message from teammate @<from>]` wrapper prefixed onto a
/// sequential handoff's body.
pub fn handoff_message(from: &AgentId, handoff: &str) -> String {
    format!("[Message from teammate @{from}]:\n{handoff}")
}

/// Format the aggregated response of a finished team chain: a single step's
/// bare text, or every step's text prefixed `@<agentId>: ` and joined by a
/// separator, once more than one agent participated.
pub fn format_chain_response(steps: &[(AgentId, String)]) -> String {
    match steps {
        [] => String::new(),
        [(_, text)] => text.clone(),
        many => many
            .iter()
            .map(|(id, text)| format!("@{id}: {text}"))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Provider};

    fn agent(id: &str, name: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            name: name.to_string(),
            provider: Provider::Anthropic,
            model: None,
            working_directory: None,
            permissions: None,
            memory: None,
        }
    }

    fn team(id: &str, agents: &[&str], leader: &str) -> TeamConfig {
        TeamConfig {
            id: id.to_string(),
            name: id.to_string(),
            agents: agents.iter().map(|s| s.to_string()).collect(),
            leader_agent: leader.to_string(),
        }
    }

    fn registry() -> Registry {
        Registry {
            agents: vec![
                agent("coder", "Coder"),
                agent("reviewer", "Reviewer"),
                agent("writer", "Writer"),
            ],
            teams: vec![team("devteam", &["coder", "reviewer"], "coder")],
            default_agent: Some("coder".to_string()),
            allowed_tools: vec![],
        }
    }

    #[test]
    fn explicit_message_agent_wins() {
        let reg = registry();
        let outcome = route("hello", Some(&AgentId("reviewer".to_string())), &reg);
        assert_eq!(
            outcome,
            RouteOutcome::Routed(RoutedMessage {
                agent_id: AgentId("reviewer".to_string()),
                message: "hello".to_string(),
                team: Some(TeamId("devteam".to_string())),
            })
        );
    }

    #[test]
    fn bang_prefix_routes_to_named_agent_and_strips_prefix() {
        let reg = registry();
        let outcome = route("!coder fix the bug", None, &reg);
        assert_eq!(
            outcome,
            RouteOutcome::Routed(RoutedMessage {
                agent_id: AgentId("coder".to_string()),
                message: "fix the bug".to_string(),
                team: Some(TeamId("devteam".to_string())),
            })
        );
    }

    #[test]
    fn bang_prefix_routes_to_team_leader() {
        let reg = registry();
        let outcome = route("!devteam please refactor", None, &reg);
        assert_eq!(
            outcome,
            RouteOutcome::Routed(RoutedMessage {
                agent_id: AgentId("coder".to_string()),
                message: "please refactor".to_string(),
                team: Some(TeamId("devteam".to_string())),
            })
        );
    }

    #[test]
    fn falls_back_to_default_agent() {
        let reg = registry();
        let outcome = route("no prefix here", None, &reg);
        assert_eq!(
            outcome,
            RouteOutcome::Routed(RoutedMessage {
                agent_id: AgentId("coder".to_string()),
                message: "no prefix here".to_string(),
                team: Some(TeamId("devteam".to_string())),
            })
        );
    }

    #[test]
    fn multi_team_mention_is_a_routing_error() {
        let mut reg = registry();
        reg.teams.push(team("writeteam", &["writer"], "writer"));
        let outcome = route("!coder and !writer help", None, &reg);
        assert_eq!(outcome, RouteOutcome::RoutingError);
    }

    #[test]
    fn tag_form_mention_is_preferred_and_filters_invalid_teammates() {
        let reg = registry();
        let team = reg.find_team("devteam").unwrap();
        let mentions = parse_team_mentions(
            "Sure, [@reviewer: please audit] [@writer: doc it]",
            team,
            &AgentId("coder".to_string()),
            &reg,
        );
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].teammate_id, AgentId("reviewer".to_string()));
        assert_eq!(mentions[0].handoff, "please audit");
    }

    #[test]
    fn bare_mention_takes_remainder_as_handoff() {
        let reg = registry();
        let team = reg.find_team("devteam").unwrap();
        let mentions = parse_team_mentions(
            "done, @reviewer please check this over",
            team,
            &AgentId("coder".to_string()),
            &reg,
        );
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].handoff, "please check this over");
    }

    #[test]
    fn chain_response_formatting_matches_single_vs_multi_step() {
        assert_eq!(
            format_chain_response(&[(AgentId("coder".to_string()), "done".to_string())]),
            "done"
        );
        assert_eq!(
            format_chain_response(&[
                (AgentId("coder".to_string()), "Sure, ".to_string()),
                (AgentId("reviewer".to_string()), "done".to_string()),
            ]),
            "@coder: Sure, \n\n---\n\n@reviewer: done"
        );
    }
}
