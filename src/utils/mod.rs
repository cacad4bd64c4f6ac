//! The `utils` module holds the pieces shared by every other module:
//! error types and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BusError, ChannelError};
    use super::logging;
    use crate::broker::message::MessageKind;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warning");
        logging::init("nonsense");
    }

    #[test]
    fn unsupported_kind_message_names_the_kind() {
        let err = BusError::UnsupportedKind(MessageKind::Unknown);
        assert_eq!(
            err.to_string(),
            "message kind 'Unknown' is not supported by this operation"
        );
    }

    #[test]
    fn channel_error_display() {
        let err = ChannelError::Faulted {
            session: "s1".to_string(),
            reason: "reset".to_string(),
        };
        assert_eq!(err.to_string(), "channel for session s1 faulted: reset");
        assert_eq!(
            ChannelError::Closed("s2".to_string()).to_string(),
            "channel for session s2 is closed"
        );
    }
}
