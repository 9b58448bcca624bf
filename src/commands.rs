//! Command execution.

use crate::Commands;
use colored::Colorize;
use gea2_bus::{ApplianceBus, BusError, VersionAnnouncement};
use gea2_protocol::{
    parse_unsigned, Address, Erd, Message, Outbound, ProtocolError, Serializer, Value,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    bus: &ApplianceBus,
    dest: Address,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Subscribe { .. } | Commands::Listen { .. } | Commands::Discover { .. } => {
            unreachable!()
        }

        Commands::Read { erds, format } => {
            let serializer = format.serializer();
            let records = with_retry(|| bus.read(dest, erds.clone())).await?;

            if records.is_empty() {
                return Ok("No data returned".yellow().to_string());
            }

            let lines: Vec<String> = records
                .iter()
                .map(|record| format_value(record.erd, serializer.deserialize(&record.data)))
                .collect();
            Ok(lines.join("\n"))
        }

        Commands::Write { erd, value, format } => {
            let value = format.kind.parse_value(&value)?;
            let object = bus.create_erd(dest, erd, Arc::new(format.serializer()));

            if object.write(&value).await? {
                Ok(format!(
                    "{} {} = {}",
                    "Wrote".green(),
                    format!("{:#06x}", erd).cyan(),
                    value
                ))
            } else {
                Ok(format!(
                    "{} write of {}",
                    "Rejected".red(),
                    format!("{:#06x}", erd).cyan()
                ))
            }
        }

        Commands::Publish { erd, value, format } => {
            let value = format.kind.parse_value(&value)?;
            let object = bus.create_erd(dest, erd, Arc::new(format.serializer()));
            object.publish(&value).await?;
            Ok(format!(
                "{} {} = {}",
                "Published".green(),
                format!("{:#06x}", erd).cyan(),
                value
            ))
        }

        Commands::Send {
            command,
            data,
            timeout_ms,
        } => {
            let mut outbound = Outbound::new(command).with_destination(dest);
            if let Some(data) = data {
                outbound = outbound.with_data(hex::decode(data)?);
            }

            let reply = match timeout_ms {
                Some(ms) => {
                    let timeout = Duration::from_millis(ms);
                    with_retry(|| bus.send_with_timeout(outbound.clone(), timeout))
                        .await?
                }
                None => with_retry(|| bus.send(outbound.clone())).await?,
            };
            Ok(format_message(&reply, false))
        }
    }
}

/// Runs `operation`, issuing it once more if the first attempt fails with a
/// retryable error.
async fn with_retry<T, F, Fut>(mut operation: F) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    match operation().await {
        Err(e) if e.is_retryable() => {
            tracing::warn!("{}, retrying once", e);
            operation().await
        }
        result => result,
    }
}

/// Parses a bus address written in decimal or `0x` hex.
pub fn parse_address(input: &str) -> Result<Address, String> {
    parse_bounded(input)
}

/// Parses an ERD identifier written in decimal or `0x` hex.
pub fn parse_erd(input: &str) -> Result<Erd, String> {
    parse_bounded(input)
}

/// Parses a command; values above `0xFF` are extended commands.
pub fn parse_command(input: &str) -> Result<u16, String> {
    parse_bounded(input)
}

fn parse_bounded<T: TryFrom<u64>>(input: &str) -> Result<T, String> {
    let value = parse_unsigned(input).map_err(|e| e.to_string())?;
    T::try_from(value).map_err(|_| format!("{} is out of range", input))
}

pub fn format_value(erd: Erd, value: Result<Value, ProtocolError>) -> String {
    let erd = format!("{:#06x}", erd).cyan();
    match value {
        Ok(value) => format!("{} = {}", erd, value),
        Err(e) => format!("{} {} ({})", erd, "undecodable".red(), e),
    }
}

pub fn format_message(message: &Message, json: bool) -> String {
    if json {
        return json!({
            "source": message.source,
            "destination": message.destination,
            "command": message.command,
            "data": hex::encode(&message.data),
        })
        .to_string();
    }

    format!(
        "{} -> {} {} [{}]",
        format!("{:#04x}", message.source).cyan(),
        format!("{:#04x}", message.destination).cyan(),
        format!("cmd={:#04x}", message.command).yellow(),
        hex::encode(&message.data)
    )
}

pub fn format_announcement(announcement: &VersionAnnouncement) -> String {
    format!("{} {}", "Found".green(), announcement.to_string().cyan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message() -> Message {
        Message::new(0xC0, 0xBB, 0xF0, vec![0x01, 0x40, 0x03])
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0xC0"), Ok(0xC0));
        assert_eq!(parse_address("192"), Ok(0xC0));
        assert!(parse_address("0x100").is_err());
        assert!(parse_address("bogus").is_err());
    }

    #[test]
    fn test_parse_erd_and_command() {
        assert_eq!(parse_erd("0x4003"), Ok(0x4003));
        assert!(parse_erd("0x10000").is_err());
        assert_eq!(parse_command("0x1234"), Ok(0x1234));
    }

    #[test]
    fn test_format_message_json() {
        colored::control::set_override(false);
        let line = format_message(&message(), true);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["source"], 0xC0);
        assert_eq!(parsed["command"], 0xF0);
        assert_eq!(parsed["data"], "014003");
    }

    #[tokio::test]
    async fn test_with_retry_retries_timeout_once() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(BusError::Timeout)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        attempts.store(0, Ordering::SeqCst);
        let result: Result<(), BusError> = with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(BusError::Timeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_rejection() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), BusError> = with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::Rejected("read returned no data".into())) }
        })
        .await;
        assert!(matches!(result, Err(BusError::Rejected(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_value() {
        colored::control::set_override(false);
        assert_eq!(format_value(0x4003, Ok(Value::Unsigned(130))), "0x4003 = 130");
        let failed = format_value(0x4003, Err(ProtocolError::InvalidValue("bad".into())));
        assert!(failed.starts_with("0x4003 undecodable"));
    }
}
