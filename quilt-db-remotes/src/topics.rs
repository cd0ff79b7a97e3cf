//! Topic scheme for a domain
//!
//! - `<domain>/operations` - delta broadcast
//! - `<domain>/registry` - retained hello (genesis election)
//! - `<domain>/control/presence/<id>` - retained presence records
//! - `<domain>/sub/<uuid>` - streamed channels
//! - `send/<to>/<from>/<message-id>/<address...>` - unicast request
//! - `reply/<to>/<from>/<message-id>/<sent-message-id>` - reply or ack

use uuid::Uuid;

use crate::error::{RemotesError, Result};

/// The delta broadcast topic
pub fn operations(domain: &str) -> String {
    format!("{}/operations", domain)
}

/// The retained-hello registry topic
pub fn registry(domain: &str) -> String {
    format!("{}/registry", domain)
}

/// Presence record topic of one clone
pub fn presence(domain: &str, id: &str) -> String {
    format!("{}/control/presence/{}", domain, id)
}

/// Filter over every clone's presence record
pub fn presence_filter(domain: &str) -> String {
    format!("{}/control/presence/+", domain)
}

/// Allocate a fresh streamed-channel address
pub fn sub_address(domain: &str) -> String {
    format!("{}/sub/{}", domain, Uuid::new_v4())
}

/// Unicast request topic
pub fn send(to: &str, from: &str, message_id: &str, address: &str) -> String {
    format!("send/{}/{}/{}/{}", to, from, message_id, address)
}

/// Filter over requests addressed to us
pub fn send_filter(id: &str) -> String {
    format!("send/{}/+/+/#", id)
}

/// Unicast reply topic
pub fn reply(to: &str, from: &str, message_id: &str, sent_message_id: &str) -> String {
    format!("reply/{}/{}/{}/{}", to, from, message_id, sent_message_id)
}

/// Filter over replies addressed to us
pub fn reply_filter(id: &str) -> String {
    format!("reply/{}/+/+/+", id)
}

/// Routing parts of an inbound request topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendAddress {
    pub from: String,
    pub message_id: String,
    pub address: String,
}

impl SendAddress {
    /// Parse `send/<to>/<from>/<message-id>/<address...>`
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.splitn(5, '/').collect();
        match parts.as_slice() {
            ["send", _to, from, message_id, address] => Ok(Self {
                from: from.to_string(),
                message_id: message_id.to_string(),
                address: address.to_string(),
            }),
            _ => Err(RemotesError::bad_message(format!(
                "malformed send topic: {}",
                topic
            ))),
        }
    }
}

/// Routing parts of an inbound reply topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyAddress {
    pub from: String,
    pub message_id: String,
    pub sent_message_id: String,
}

impl ReplyAddress {
    /// Parse `reply/<to>/<from>/<message-id>/<sent-message-id>`
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["reply", _to, from, message_id, sent_message_id] => Ok(Self {
                from: from.to_string(),
                message_id: message_id.to_string(),
                sent_message_id: sent_message_id.to_string(),
            }),
            _ => Err(RemotesError::bad_message(format!(
                "malformed reply topic: {}",
                topic
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_round_trip() {
        let topic = send("b", "a", "m1", "control");
        assert_eq!(topic, "send/b/a/m1/control");
        let parsed = SendAddress::parse(&topic).unwrap();
        assert_eq!(parsed.from, "a");
        assert_eq!(parsed.message_id, "m1");
        assert_eq!(parsed.address, "control");
    }

    #[test]
    fn test_send_multi_level_address() {
        let parsed = SendAddress::parse("send/b/a/m1/control/deep/path").unwrap();
        assert_eq!(parsed.address, "control/deep/path");
    }

    #[test]
    fn test_reply_round_trip() {
        let topic = reply("a", "b", "m2", "m1");
        let parsed = ReplyAddress::parse(&topic).unwrap();
        assert_eq!(parsed.from, "b");
        assert_eq!(parsed.message_id, "m2");
        assert_eq!(parsed.sent_message_id, "m1");
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(SendAddress::parse("send/b/a").is_err());
        assert!(ReplyAddress::parse("reply/a/b/m2").is_err());
    }
}
