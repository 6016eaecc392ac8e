//! Constructors for the client events a telephony relay sends.

use crate::types::{
    ClientEvent, ConversationItemCreateEvent, ConversationItemTruncateEvent,
    InputAudioBufferAppendEvent, Item, ItemContent, ItemContentType, ItemRole, ItemType,
    ResponseCancelEvent, ResponseCreateEvent, SessionResource, SessionUpdateEvent,
};

pub fn session_update(session: SessionResource) -> ClientEvent {
    ClientEvent::SessionUpdate(SessionUpdateEvent {
        session,
        event_id: None,
    })
}

/// Appends base64-encoded audio in the session's input format.
pub fn audio_append(audio: String) -> ClientEvent {
    ClientEvent::InputAudioBufferAppend(InputAudioBufferAppendEvent {
        audio,
        event_id: None,
    })
}

/// A system message, used to nudge the model mid-call.
pub fn system_message(text: impl Into<String>) -> ClientEvent {
    item_create(Item {
        r#type: Some(ItemType::Message),
        role: Some(ItemRole::System),
        content: Some(vec![ItemContent {
            r#type: ItemContentType::InputText,
            text: Some(text.into()),
            audio: None,
            transcript: None,
        }]),
        id: None,
        status: None,
        call_id: None,
        name: None,
        arguments: None,
        output: None,
    })
}

/// Carries a tool result back into the conversation.
pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> ClientEvent {
    item_create(Item {
        r#type: Some(ItemType::FunctionCallOutput),
        role: None,
        content: None,
        id: None,
        status: None,
        call_id: Some(call_id.into()),
        name: None,
        arguments: None,
        output: Some(output.into()),
    })
}

fn item_create(item: Item) -> ClientEvent {
    ClientEvent::ConversationItemCreate(ConversationItemCreateEvent {
        item,
        event_id: None,
        previous_item_id: None,
    })
}

/// Asks for a response using the session defaults.
pub fn response_create() -> ClientEvent {
    ClientEvent::ResponseCreate(ResponseCreateEvent {
        response: None,
        event_id: None,
    })
}

pub fn response_cancel() -> ClientEvent {
    ClientEvent::ResponseCancel(ResponseCancelEvent { event_id: None })
}

/// Discards assistant audio past `audio_end_ms`, the part the caller never heard.
pub fn truncate(item_id: impl Into<String>, content_index: u32, audio_end_ms: u32) -> ClientEvent {
    ClientEvent::ConversationItemTruncate(ConversationItemTruncateEvent {
        event_id: None,
        item_id: item_id.into(),
        content_index,
        audio_end_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_output_item_shape() {
        let value = serde_json::to_value(function_output("call_1", r#"{"ok":true}"#)).unwrap();
        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_1");
        assert_eq!(value["item"]["output"], r#"{"ok":true}"#);
    }

    #[test]
    fn test_system_message_shape() {
        let value = serde_json::to_value(system_message("Greet the caller")).unwrap();
        assert_eq!(value["item"]["type"], "message");
        assert_eq!(value["item"]["role"], "system");
        assert_eq!(value["item"]["content"][0]["type"], "input_text");
        assert_eq!(value["item"]["content"][0]["text"], "Greet the caller");
    }

    #[test]
    fn test_barge_in_events_on_the_wire() {
        let value = serde_json::to_value(truncate("item_9", 0, 1200)).unwrap();
        assert_eq!(value["type"], "conversation.item.truncate");
        assert_eq!(value["item_id"], "item_9");
        assert_eq!(value["audio_end_ms"], 1200);
        assert_eq!(
            serde_json::to_value(response_cancel()).unwrap()["type"],
            json!("response.cancel")
        );
    }
}
