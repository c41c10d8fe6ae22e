//! Wire codec for signals.
//!
//! Wire form is a colon-joined ASCII string:
//! - `name:timestamp:sender` (recipient empty)
//! - `name:timestamp:sender:recipient`
//!
//! Anything else is malformed. Encoding always produces the four-field form and
//! stamps the current time.

use chrono::Utc;

use super::protocol::Signal;

const SEPARATOR: char = ':';

/// Timestamp of a decoded signal whose wire timestamp is not a number.
pub const UNKNOWN_TIMESTAMP: f64 = 0.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("malformed signal: expected 3 or 4 fields, got {fields}")]
    Malformed { fields: usize },
}

/// Decode a wire string into a signal.
pub fn decode(wire: &str) -> Result<Signal, SignalError> {
    let fields: Vec<&str> = wire.split(SEPARATOR).collect();
    let (name, timestamp, sender, recipient) = match fields.as_slice() {
        [name, timestamp, sender] => (*name, *timestamp, *sender, ""),
        [name, timestamp, sender, recipient] => (*name, *timestamp, *sender, *recipient),
        other => return Err(SignalError::Malformed { fields: other.len() }),
    };

    let timestamp = timestamp.trim().parse::<f64>().unwrap_or_else(|_| {
        tracing::debug!(%wire, %timestamp, "Unreadable timestamp, using 0");
        UNKNOWN_TIMESTAMP
    });

    Ok(Signal::new(name, sender, recipient, timestamp))
}

/// Encode a signal, stamping it with the current time.
///
/// Any timestamp carried by `signal` is ignored: the wire timestamp is the
/// send time.
pub fn encode(signal: &Signal) -> String {
    encode_at(signal, now())
}

/// Encode a signal with an explicit timestamp.
pub fn encode_at(signal: &Signal, timestamp: f64) -> String {
    format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
        signal.name, timestamp, signal.sender, signal.recipient
    )
}

/// Seconds since the Unix epoch, microsecond resolution.
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_four_fields() {
        let signal = decode("hello:1000.0:ext:B").unwrap();
        assert_eq!(signal, Signal::new("hello", "ext", "B", 1000.0));
    }

    #[test]
    fn decode_three_fields_has_empty_recipient() {
        let signal = decode("ping:1000.0:ext").unwrap();
        assert_eq!(signal, Signal::new("ping", "ext", "", 1000.0));
        assert!(signal.is_broadcast());
    }

    #[test]
    fn decode_rejects_other_field_counts() {
        for wire in ["", "stop", "stop:1.0", "a:1.0:b:c:d", "ending: A:1.0:pm:"] {
            assert!(
                matches!(decode(wire), Err(SignalError::Malformed { .. })),
                "{wire:?} should be malformed"
            );
        }
        assert_eq!(
            decode("a:1:b:c:d:e"),
            Err(SignalError::Malformed { fields: 6 })
        );
    }

    #[test]
    fn decode_keeps_signal_with_unreadable_timestamp() {
        assert_eq!(
            decode("hello:noon:ext:B"),
            Ok(Signal::new("hello", "ext", "B", UNKNOWN_TIMESTAMP))
        );
        assert_eq!(
            decode("hello::ext:B"),
            Ok(Signal::new("hello", "ext", "B", UNKNOWN_TIMESTAMP))
        );
        assert_eq!(
            decode("ping:t0:ext"),
            Ok(Signal::new("ping", "ext", "", UNKNOWN_TIMESTAMP))
        );
    }

    #[test]
    fn encode_always_emits_four_fields() {
        let signal = Signal::new("ping", "A", "", 0.0);
        assert_eq!(encode_at(&signal, 1000.5), "ping:1000.5:A:");
        assert_eq!(encode(&signal).split(':').count(), 4);
    }

    #[test]
    fn encode_restamps_timestamp() {
        let signal = Signal::new("hello", "ext", "B", 1.0);
        let decoded = decode(&encode(&signal)).unwrap();
        assert!(decoded.timestamp > 1.0);
    }

    #[test]
    fn roundtrip_preserves_routing_fields() {
        let signal = Signal::new("hello", "A", "B", 0.0);
        let decoded = decode(&encode(&signal)).unwrap();
        assert_eq!(decoded.name, "hello");
        assert_eq!(decoded.sender, "A");
        assert_eq!(decoded.recipient, "B");
    }
}
