//! Control commands and their delivery

use clap::ValueEnum;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gateway::bus::oneshot::publish_once;
use gateway::retry::{retry_with_policy, RetryError, RetryPolicy};
use gateway::GatewayConfig;

/// Time allowed for one connect + publish + PUBACK round trip
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_ATTEMPTS: u32 = 3;

/// Command accepted by the gateway's control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    /// Wire payload; the gateway matches it case-sensitively
    pub fn payload(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
        }
    }
}

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Send(Command),
    Exit,
    Empty,
    Invalid(String),
}

impl PromptInput {
    /// Case-insensitive, surrounding whitespace ignored
    pub fn parse(line: &str) -> Self {
        let word = line.trim();
        match word.to_ascii_uppercase().as_str() {
            "" => PromptInput::Empty,
            "START" => PromptInput::Send(Command::Start),
            "STOP" => PromptInput::Send(Command::Stop),
            "EXIT" => PromptInput::Exit,
            _ => PromptInput::Invalid(word.to_string()),
        }
    }
}

/// Client id for a single send, unique enough to not kick the gateway off
pub fn client_id(base: &str) -> String {
    format!("{}-remote-{:04x}", base, rand::thread_rng().gen::<u16>())
}

/// Open a connection, publish `command` once, disconnect
///
/// A failed attempt is retried a few times with a fresh connection.
pub async fn send(
    config: &GatewayConfig,
    command: Command,
    cancel: &CancellationToken,
) -> Result<(), RetryError> {
    let policy = RetryPolicy::bounded_exponential(
        SEND_ATTEMPTS,
        Duration::from_secs(1),
        Duration::from_secs(4),
    );
    let client_id = client_id(&config.bus.client_id);

    let bus = &config.bus;
    let topic = config.topics.control.as_str();
    let id = client_id.as_str();
    let payload = command.payload().as_bytes();

    retry_with_policy(&policy, cancel, "Send command", move |_| {
        publish_once(bus, id, topic, payload, PUBLISH_TIMEOUT)
    })
    .await?;

    info!(command = command.payload(), topic, "Command acknowledged by broker");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_case_insensitive() {
        assert_eq!(PromptInput::parse("start"), PromptInput::Send(Command::Start));
        assert_eq!(PromptInput::parse("  Stop \n"), PromptInput::Send(Command::Stop));
        assert_eq!(PromptInput::parse("EXIT"), PromptInput::Exit);
        assert_eq!(PromptInput::parse("exit"), PromptInput::Exit);
    }

    #[test]
    fn test_prompt_rejects_other_words() {
        assert_eq!(PromptInput::parse(""), PromptInput::Empty);
        assert_eq!(PromptInput::parse("   "), PromptInput::Empty);
        assert_eq!(
            PromptInput::parse("restart"),
            PromptInput::Invalid("restart".to_string())
        );
    }

    #[test]
    fn test_payload_matches_gateway_commands() {
        use gateway::bus::ControlCommand;

        for (command, expected) in [
            (Command::Start, ControlCommand::Start),
            (Command::Stop, ControlCommand::Stop),
        ] {
            assert_eq!(ControlCommand::parse(command.payload().as_bytes()), expected);
        }
    }

    #[test]
    fn test_client_id_is_derived_from_gateway_id() {
        let id = client_id("telemetry-gateway");
        assert!(id.starts_with("telemetry-gateway-remote-"));
        assert_eq!(id.len(), "telemetry-gateway-remote-".len() + 4);
    }

    #[tokio::test]
    async fn test_send_gives_up_against_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = GatewayConfig::default();
        config.bus.host = "127.0.0.1".to_string();
        config.bus.port = port;

        tokio::time::pause();
        let result = send(&config, Command::Start, &CancellationToken::new()).await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_send_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = send(&GatewayConfig::default(), Command::Stop, &cancel).await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
