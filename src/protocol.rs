// MIT License - Copyright (c) 2021 TJForc
// Tesira Text Protocol commands and reply grammar

use crate::config::{Attribute, Subscription};
use crate::constants::{
    ALREADY_SUBSCRIBED, DEVICE_INSTANCE_TAG, ERR, OK, OK_VALUE_PREFIX, PUBLISH_TOKEN_PREFIX,
    VALUE_FIELD,
};
use crate::error::{Result, TesiraError};

/// Commands that can be sent to a Tesira device.
///
/// Every command is a single ASCII line of the form `<instance tag> <verb> <attribute> [args]`.
/// The device echoes the command back before replying with `+OK`, `+OK "value":<v>` or
/// `-ERR <reason>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `<tag> subscribe <attribute> <index> <token>`: push value changes tagged with `token`.
    /// The device answers with one publish-token line carrying the current value, then `+OK`.
    Subscribe {
        instance_tag: String,
        attribute: Attribute,
        index: u32,
        token: String,
    },
    /// `<tag> get <field> <index>`: read a single value.
    Get {
        instance_tag: String,
        field: String,
        index: u32,
    },
    /// `<tag> set <attribute> <index> <value>`: write a value. `value` is sent verbatim.
    Set {
        instance_tag: String,
        attribute: Attribute,
        index: u32,
        value: String,
    },
    /// `DEVICE get serialNumber`
    SerialNumber,
}

impl Command {
    pub fn subscribe(subscription: &Subscription) -> Self {
        Command::Subscribe {
            instance_tag: subscription.instance_tag.clone(),
            attribute: subscription.attribute.clone(),
            index: subscription.index,
            token: subscription.identifier(),
        }
    }

    pub fn min_level(subscription: &Subscription) -> Self {
        Command::Get {
            instance_tag: subscription.instance_tag.clone(),
            field: "minLevel".to_string(),
            index: subscription.index,
        }
    }

    pub fn max_level(subscription: &Subscription) -> Self {
        Command::Get {
            instance_tag: subscription.instance_tag.clone(),
            field: "maxLevel".to_string(),
            index: subscription.index,
        }
    }

    /// Convert the command to its wire string representation (without terminator).
    pub fn to_wire_string(&self) -> String {
        match self {
            Command::Subscribe {
                instance_tag,
                attribute,
                index,
                token,
            } => format!("{instance_tag} subscribe {attribute} {index} {token}"),
            Command::Get {
                instance_tag,
                field,
                index,
            } => format!("{instance_tag} get {field} {index}"),
            Command::Set {
                instance_tag,
                attribute,
                index,
                value,
            } => format!("{instance_tag} set {attribute} {index} {value}"),
            Command::SerialNumber => format!("{DEVICE_INSTANCE_TAG} get serialNumber"),
        }
    }
}

/// An asynchronous value change pushed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishToken {
    pub identifier: String,
    /// Raw value text with surrounding quotes removed.
    pub value: String,
}

/// One classified line from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Empty line (after NUL and whitespace stripping).
    Blank,
    /// Bare `+OK`.
    Ok,
    /// `+OK "value":<v>`, quotes removed.
    Value(String),
    /// `-ERR ALREADY_SUBSCRIBED`
    AlreadySubscribed,
    /// Any other `-ERR <reason>`, raw line preserved.
    Error(String),
    /// `! "publishToken":"<id>" "value":<v>`
    Publish(PublishToken),
    /// Anything else, e.g. the echoed command.
    Other(String),
}

impl Reply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Reply::Blank;
        }
        if line == OK {
            return Reply::Ok;
        }
        if let Some(value) = line.strip_prefix(OK_VALUE_PREFIX) {
            return Reply::Value(unquote(value).to_string());
        }
        if line.starts_with(ALREADY_SUBSCRIBED) {
            return Reply::AlreadySubscribed;
        }
        if line.starts_with(ERR) {
            return Reply::Error(line.to_string());
        }
        if let Some(token) = parse_publish_token(line) {
            return Reply::Publish(token);
        }
        Reply::Other(line.to_string())
    }
}

/// Parse `! "publishToken":"<identifier>" "value":<value>`.
///
/// The value runs to the end of the line so quoted values containing spaces survive.
pub fn parse_publish_token(line: &str) -> Option<PublishToken> {
    let rest = line.trim().strip_prefix(PUBLISH_TOKEN_PREFIX)?;
    let rest = rest.strip_prefix('"')?;
    let (identifier, rest) = rest.split_once('"')?;
    let value_pos = rest.find(VALUE_FIELD)?;
    let value = &rest[value_pos + VALUE_FIELD.len()..];
    if identifier.is_empty() {
        return None;
    }
    Some(PublishToken {
        identifier: identifier.to_string(),
        value: unquote(value.trim()).to_string(),
    })
}

/// Interpret the reply to a synchronous command.
///
/// `-ERR` fails, a bare `+OK` yields `None`, a value reply yields the unquoted value and any
/// other reply is returned verbatim.
pub fn interpret_command_reply(reply: &str) -> Result<Option<String>> {
    let reply = reply.trim();
    if reply.starts_with(ERR) {
        return Err(TesiraError::Response {
            reply: reply.to_string(),
        });
    }
    if reply == OK {
        return Ok(None);
    }
    if let Some(value) = reply.strip_prefix(OK_VALUE_PREFIX) {
        return Ok(Some(unquote(value).to_string()));
    }
    Ok(Some(reply.to_string()))
}

/// Whether `line` is the device echoing `command` back.
pub fn is_echo(line: &str, command: &str) -> bool {
    !command.is_empty() && line.contains(command)
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_strings() {
        let sub = Subscription::new("Level1", Attribute::Level, 2, "Main", "Room");
        assert_eq!(
            Command::subscribe(&sub).to_wire_string(),
            "Level1 subscribe level 2 Level1_level_2"
        );
        assert_eq!(
            Command::min_level(&sub).to_wire_string(),
            "Level1 get minLevel 2"
        );
        assert_eq!(
            Command::max_level(&sub).to_wire_string(),
            "Level1 get maxLevel 2"
        );
        assert_eq!(
            Command::Set {
                instance_tag: "tag".to_string(),
                attribute: Attribute::Mute,
                index: 1,
                value: "true".to_string(),
            }
            .to_wire_string(),
            "tag set mute 1 true"
        );
        assert_eq!(
            Command::SerialNumber.to_wire_string(),
            "DEVICE get serialNumber"
        );
    }

    #[test]
    fn test_command_reply_literals() {
        assert_eq!(interpret_command_reply("+OK").unwrap(), None);
        assert_eq!(
            interpret_command_reply("+OK \"value\":\"42.5\"").unwrap(),
            Some("42.5".to_string())
        );
        let err = interpret_command_reply("-ERR INVALID_INDEX").unwrap_err();
        assert!(matches!(err, TesiraError::Response { .. }));
        assert!(err.to_string().contains("INVALID_INDEX"));
    }

    #[test]
    fn test_command_reply_unquoted_and_verbatim() {
        assert_eq!(
            interpret_command_reply("+OK \"value\":-20.000000").unwrap(),
            Some("-20.000000".to_string())
        );
        assert_eq!(
            interpret_command_reply("something odd").unwrap(),
            Some("something odd".to_string())
        );
    }

    #[test]
    fn test_parse_publish_token() {
        let token =
            parse_publish_token("! \"publishToken\":\"Level1_level_1\" \"value\":-12.500000")
                .unwrap();
        assert_eq!(token.identifier, "Level1_level_1");
        assert_eq!(token.value, "-12.500000");

        let token =
            parse_publish_token("! \"publishToken\":\"Mixer1_mute_3\" \"value\":true").unwrap();
        assert_eq!(token.identifier, "Mixer1_mute_3");
        assert_eq!(token.value, "true");
    }

    #[test]
    fn test_parse_publish_token_quoted_value_with_spaces() {
        let token =
            parse_publish_token("! \"publishToken\":\"Src_label_1\" \"value\":\"Aux In 1\"")
                .unwrap();
        assert_eq!(token.value, "Aux In 1");
    }

    #[test]
    fn test_parse_publish_token_rejects_other_lines() {
        assert!(parse_publish_token("+OK").is_none());
        assert!(parse_publish_token("! \"publishToken\":\"\" \"value\":1").is_none());
        assert!(parse_publish_token("! \"publishToken\":\"x\"").is_none());
    }

    #[test]
    fn test_reply_classification() {
        assert_eq!(Reply::parse(""), Reply::Blank);
        assert_eq!(Reply::parse("  \r"), Reply::Blank);
        assert_eq!(Reply::parse("+OK"), Reply::Ok);
        assert_eq!(
            Reply::parse("+OK \"value\":12.000000"),
            Reply::Value("12.000000".to_string())
        );
        assert_eq!(
            Reply::parse("-ERR ALREADY_SUBSCRIBED"),
            Reply::AlreadySubscribed
        );
        assert_eq!(
            Reply::parse("-ERR address not found: {\"deviceId\":0 \"classCode\":0}"),
            Reply::Error("-ERR address not found: {\"deviceId\":0 \"classCode\":0}".to_string())
        );
        assert!(matches!(
            Reply::parse("! \"publishToken\":\"a_mute_1\" \"value\":false"),
            Reply::Publish(_)
        ));
        assert_eq!(
            Reply::parse("Level1 get minLevel 1"),
            Reply::Other("Level1 get minLevel 1".to_string())
        );
    }

    #[test]
    fn test_is_echo() {
        assert!(is_echo("Level1 get minLevel 1", "Level1 get minLevel 1"));
        assert!(!is_echo("+OK", "Level1 get minLevel 1"));
    }
}
