//! Interactive operator console

use simproxy_agent::AgentProxy;
use simproxy_server::RelayServer;
use std::fmt::Write as _;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const HELP: &str = "Commands:
  q, quit     stop the proxy
  l, list     list active agents
  v, verbose  list active agents with statistics
  s, status   show proxy status and all agents
  m           toggle echo of messages sent to agents
  n           toggle echo of messages sent to the server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    List,
    Verbose,
    Status,
    ToggleClientEcho,
    ToggleServerEcho,
    Unknown(String),
}

impl Command {
    /// Parse one console line; blank lines yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.trim();
        let command = match word {
            "" => return None,
            "q" | "quit" => Command::Quit,
            "l" | "list" => Command::List,
            "v" | "verbose" => Command::Verbose,
            "s" | "status" => Command::Status,
            "m" => Command::ToggleClientEcho,
            "n" => Command::ToggleServerEcho,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

/// Produce the console output for `command`
///
/// Agents are numbered by their position in `agents`, so numbers stay stable
/// between `list` and `status`.
pub fn render(command: &Command, agents: &[Arc<AgentProxy>], alive: bool) -> String {
    let mut out = String::new();
    match command {
        Command::Quit => out.push_str("Stopping proxy"),
        Command::List => {
            for (index, agent) in agents.iter().enumerate() {
                if agent.is_active() {
                    let _ = writeln!(out, "{}: {}", index + 1, agent);
                }
            }
            let _ = write!(out, "Active agents: {}", count_active(agents));
        }
        Command::Verbose => {
            for (index, agent) in agents.iter().enumerate() {
                if agent.is_active() {
                    let _ = writeln!(out, "{}: {}", index + 1, agent.verbose_summary());
                }
            }
            let _ = write!(out, "Active agents: {}", count_active(agents));
        }
        Command::Status => {
            let _ = writeln!(out, "Proxy alive: {}", alive);
            let _ = write!(out, "All agents ({}):", agents.len());
            for (index, agent) in agents.iter().enumerate() {
                let _ = write!(out, "\n{}: {}", index + 1, agent);
            }
        }
        Command::ToggleClientEcho => {
            let mut enabled = 0;
            for agent in agents {
                if agent.toggle_client_echo() {
                    enabled += 1;
                }
            }
            let _ = write!(
                out,
                "Agent-bound echo on for {} of {} agents",
                enabled,
                agents.len()
            );
        }
        Command::ToggleServerEcho => {
            let mut enabled = 0;
            for agent in agents {
                if agent.toggle_server_echo() {
                    enabled += 1;
                }
            }
            let _ = write!(
                out,
                "Server-bound echo on for {} of {} agents",
                enabled,
                agents.len()
            );
        }
        Command::Unknown(word) => {
            let _ = write!(out, "Unknown command '{}'\n{}", word, HELP);
        }
    }
    out
}

fn count_active(agents: &[Arc<AgentProxy>]) -> usize {
    agents.iter().filter(|agent| agent.is_active()).count()
}

/// Read commands from stdin until `quit`
///
/// Lines are read on a plain thread: a pending tokio stdin read would keep
/// the runtime from shutting down.
pub async fn run(server: Arc<RelayServer>) {
    println!("{}", HELP);

    let (tx, mut rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    });

    while let Some(line) = rx.recv().await {
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        println!("{}", render(&command, &server.agents(), server.is_alive()));
        if command == Command::Quit {
            return;
        }
    }

    // Without a console the proxy keeps running until Ctrl+C
    debug!("Console input closed");
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use simproxy_agent::DialTarget;
    use simproxy_connection::FramedChannel;
    use tokio::net::{TcpListener, TcpStream};

    fn idle_agent(port: u16) -> Arc<AgentProxy> {
        Arc::new(AgentProxy::from_channels(
            FramedChannel::lazy(DialTarget::new("127.0.0.1", port)),
            FramedChannel::lazy(DialTarget::new("127.0.0.1", 3100)),
        ))
    }

    /// A started proxy waiting for its agent's first action
    async fn live_agent() -> (Arc<AgentProxy>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let proxy = AgentProxy::new(accepted, DialTarget::new("127.0.0.1", 3100)).start();
        (proxy, agent)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("q"), Some(Command::Quit));
        assert_eq!(Command::parse("quit\n"), Some(Command::Quit));
        assert_eq!(Command::parse(" l "), Some(Command::List));
        assert_eq!(Command::parse("list"), Some(Command::List));
        assert_eq!(Command::parse("v"), Some(Command::Verbose));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("m"), Some(Command::ToggleClientEcho));
        assert_eq!(Command::parse("n"), Some(Command::ToggleServerEcho));
        assert_eq!(
            Command::parse("x"),
            Some(Command::Unknown("x".to_string()))
        );
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn test_unknown_command_prints_help() {
        let out = render(&Command::Unknown("x".to_string()), &[], true);
        assert!(out.starts_with("Unknown command 'x'"));
        assert!(out.contains("q, quit"));
    }

    #[tokio::test]
    async fn test_status_lists_every_agent() {
        let (first, _agent1) = live_agent().await;
        let (second, _agent2) = live_agent().await;
        second.stop().await;
        let agents = vec![first, second];

        let out = render(&Command::Status, &agents, true);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Proxy alive: true");
        assert_eq!(lines[1], "All agents (2):");
        assert!(lines[2].starts_with("1: Agent (active)"));
        assert!(lines[3].starts_with("2: Agent (inactive)"));
    }

    #[tokio::test]
    async fn test_list_skips_inactive_agents() {
        let (first, _agent1) = live_agent().await;
        let (second, _agent2) = live_agent().await;
        first.stop().await;
        let agents = vec![first, second];

        let out = render(&Command::List, &agents, true);
        assert!(!out.contains("1: Agent"));
        assert!(out.contains("2: Agent (active)"));
        assert!(out.ends_with("Active agents: 1"));

        let out = render(&Command::Verbose, &agents, true);
        assert!(out.contains("2: Agent (active)"));
        assert!(out.contains("received: count: 0"));
    }

    #[test]
    fn test_toggle_echo_reports_new_state() {
        let agents = vec![idle_agent(4001), idle_agent(4002)];

        let out = render(&Command::ToggleClientEcho, &agents, true);
        assert_eq!(out, "Agent-bound echo on for 2 of 2 agents");
        let out = render(&Command::ToggleClientEcho, &agents, true);
        assert_eq!(out, "Agent-bound echo on for 0 of 2 agents");

        let out = render(&Command::ToggleServerEcho, &agents, true);
        assert_eq!(out, "Server-bound echo on for 2 of 2 agents");
    }
}
