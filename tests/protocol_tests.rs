#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for trivia-session.
//!
//! Verifies the JSON shape of frames and contract types against fixtures
//! that match real server output, and the PascalCase encoding of reason
//! codes.

use serde_json::{json, Value};
use trivia_session::error_codes::{GameCreationResultCode, JoinGameErrorType};
use trivia_session::protocol::{
    ChatMessage, ClientFrame, GameCreationResult, GameInfo, GameRules, HostInfo, JoinDescriptor,
    JoinGameResponse, PackageKey, Role, ServerAppSettings, ServerFrame, Sex, Slice, SYSTEM_RECEIVER,
};

// ════════════════════════════════════════════════════════════════════
// Frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn invocation_frame_shape() {
    let frame = ClientFrame::Invocation {
        invocation_id: Some("7".into()),
        target: "JoinLobby2".into(),
        arguments: vec![json!("en-US")],
    };
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({
            "type": "invocation",
            "invocation_id": "7",
            "target": "JoinLobby2",
            "arguments": ["en-US"]
        })
    );
}

#[test]
fn fire_and_forget_invocation_omits_the_id() {
    let frame = ClientFrame::Invocation {
        invocation_id: None,
        target: "SendMessage".into(),
        arguments: vec![],
    };
    let value = serde_json::to_value(&frame).unwrap();
    assert!(value.get("invocation_id").is_none());
    assert_eq!(serde_json::to_value(ClientFrame::Ping).unwrap(), json!({ "type": "ping" }));
}

#[test]
fn completion_without_result_parses() {
    let frame: ServerFrame = serde_json::from_str(r#"{"type":"completion","invocation_id":"3"}"#).unwrap();
    assert_eq!(
        frame,
        ServerFrame::Completion {
            invocation_id: "3".into(),
            result: None,
            error: None,
        }
    );
}

#[test]
fn completion_with_error_parses() {
    let frame: ServerFrame =
        serde_json::from_str(r#"{"type":"completion","invocation_id":"4","error":"boom"}"#).unwrap();
    assert!(matches!(frame, ServerFrame::Completion { error: Some(ref e), .. } if e == "boom"));
}

#[test]
fn pushed_invocation_defaults_to_no_arguments() {
    let frame: ServerFrame = serde_json::from_str(r#"{"type":"invocation","target":"Disconnect"}"#).unwrap();
    assert_eq!(
        frame,
        ServerFrame::Invocation {
            target: "Disconnect".into(),
            arguments: vec![],
        }
    );
}

#[test]
fn close_frame_with_and_without_error() {
    let plain: ServerFrame = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
    assert_eq!(plain, ServerFrame::Close { error: None });
    let failed: ServerFrame = serde_json::from_str(r#"{"type":"close","error":"kicked"}"#).unwrap();
    assert_eq!(failed, ServerFrame::Close { error: Some("kicked".into()) });
}

#[test]
fn unknown_frame_type_is_rejected() {
    assert!(serde_json::from_str::<ServerFrame>(r#"{"type":"stream_item"}"#).is_err());
}

// ════════════════════════════════════════════════════════════════════
// Contracts
// ════════════════════════════════════════════════════════════════════

#[test]
fn join_request_uses_pascal_case() {
    let descriptor = JoinDescriptor::new(3, "alice", Role::Showman, Sex::Female).with_pin(99);
    assert_eq!(
        serde_json::to_value(descriptor.to_request()).unwrap(),
        json!({
            "GameId": 3,
            "UserName": "alice",
            "Role": "Showman",
            "Sex": "Female",
            "Password": null,
            "Pin": 99
        })
    );
}

#[test]
fn join_response_fixture() {
    let response: JoinGameResponse =
        serde_json::from_value(json!({ "IsSuccess": false, "ErrorType": "GameNotFound" })).unwrap();
    assert!(!response.is_success);
    assert_eq!(response.error_type, Some(JoinGameErrorType::GameNotFound));
    assert_eq!(response.message, None);
}

#[test]
fn creation_result_defaults_to_ok() {
    let result: GameCreationResult = serde_json::from_value(json!({ "GameId": 12 })).unwrap();
    assert!(result.code.is_ok());
    assert_eq!(result.game_id, 12);

    let failed: GameCreationResult =
        serde_json::from_value(json!({ "Code": "GameNameCollision", "ErrorMessage": "taken" })).unwrap();
    assert_eq!(failed.code, GameCreationResultCode::GameNameCollision);
    assert!(!failed.code.is_ok());
}

#[test]
fn games_slice_fixture() {
    let slice: Slice<GameInfo> = serde_json::from_value(json!({
        "Data": [
            { "GameID": 1, "GameName": "first", "Owner": "ann", "Started": true },
            { "GameID": 2, "GameName": "second", "PasswordRequired": true }
        ],
        "IsLastSlice": false
    }))
    .unwrap();
    assert_eq!(slice.data.len(), 2);
    assert_eq!(slice.data[0].game_id, 1);
    assert!(slice.data[0].started);
    assert!(slice.data[1].password_required);
    assert!(!slice.is_last_slice);
}

#[test]
fn host_info_tolerates_missing_fields() {
    let info: HostInfo = serde_json::from_value(json!({ "Name": "Main" })).unwrap();
    assert_eq!(info.name, "Main");
    assert!(info.content_public_base_urls.is_empty());
    assert_eq!(info.license, None);
}

#[test]
fn system_chat_message_shape() {
    let message = ChatMessage {
        text: "READY\n+".into(),
        is_system: true,
        sender: None,
        receiver: SYSTEM_RECEIVER.into(),
    };
    assert_eq!(
        serde_json::to_value(message).unwrap(),
        json!({ "Text": "READY\n+", "IsSystem": true, "Receiver": "@" })
    );
}

#[test]
fn rules_map_to_app_settings() {
    let rules = GameRules::FALSE_START.with(GameRules::IGNORE_WRONG);
    let settings = ServerAppSettings::from_rules(rules, "en-US");
    assert!(settings.false_start);
    assert!(!settings.oral);
    assert!(settings.ignore_wrong);
    assert_eq!(serde_json::to_value(&settings).unwrap()["Culture"], json!("en-US"));
}

#[test]
fn random_package_key() {
    let key = serde_json::to_value(PackageKey::random()).unwrap();
    assert_eq!(key["Id"], json!("random"));
    assert_eq!(key["Uri"], Value::Null);
}
