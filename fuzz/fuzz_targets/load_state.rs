#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use piped_core::state::{load_state, state_path};
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(state_path(td.path()), data).is_ok() {
        let _ = load_state(td.path());
    }
});
