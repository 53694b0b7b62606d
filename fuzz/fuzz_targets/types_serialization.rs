#![no_main]

use libfuzzer_sys::fuzz_target;
use piped_core::types::{Deployment, PipedRuntimeState};

fuzz_target!(|data: &[u8]| {
    if let Ok(json_str) = std::str::from_utf8(data) {
        if let Ok(state) = serde_json::from_str::<PipedRuntimeState>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&state) {
                if let Ok(parsed) = serde_json::from_str::<PipedRuntimeState>(&roundtripped) {
                    assert_eq!(state.piped_id, parsed.piped_id);
                    assert_eq!(state.deployments.len(), parsed.deployments.len());
                }
            }
        }

        if let Ok(deployment) = serde_json::from_str::<Deployment>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&deployment) {
                if let Ok(parsed) = serde_json::from_str::<Deployment>(&roundtripped) {
                    assert_eq!(deployment.id, parsed.id);
                    assert_eq!(deployment.stages.len(), parsed.stages.len());
                }
            }
        }
    }
});