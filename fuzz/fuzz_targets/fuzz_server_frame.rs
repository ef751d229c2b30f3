#![no_main]

use libfuzzer_sys::fuzz_target;
use trivia_session::protocol::{GameCreationResult, GameInfo, JoinGameResponse, ServerFrame, Slice};

fuzz_target!(|data: &[u8]| {
    // Frames arrive as text; invalid UTF-8 must be rejected, never panic.
    let Ok(frame) = serde_json::from_slice::<ServerFrame>(data) else {
        return;
    };

    // Completion results are decoded into contract types by the clients.
    if let ServerFrame::Completion {
        result: Some(result),
        ..
    } = frame
    {
        let _ = serde_json::from_value::<JoinGameResponse>(result.clone());
        let _ = serde_json::from_value::<GameCreationResult>(result.clone());
        let _ = serde_json::from_value::<Slice<GameInfo>>(result);
    }
});
