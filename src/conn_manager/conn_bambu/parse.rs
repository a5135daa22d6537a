use super::message::Message;

pub(crate) fn parse_message(message: &rumqttc::mqttbytes::v4::Publish) -> Message {
    parse_payload(&message.payload)
}

pub(crate) fn parse_payload(payload: &[u8]) -> Message {
    if let Ok(parsed_message) = serde_json::from_slice::<Message>(payload) {
        parsed_message
    } else {
        if payload.is_empty() {
            return Message::Unknown(None);
        }
        if let Ok(message_str) = String::from_utf8(payload.to_vec()) {
            if &message_str != "{}" {
                return Message::Unknown(Some(message_str));
            }
        }
        Message::Unknown(None)
    }
}
