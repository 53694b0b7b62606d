#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use piped_core::auth::resolve_piped_key;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let key_file = td.path().join("piped-key");
    if fs::write(&key_file, data).is_err() {
        return;
    }

    temp_env::with_var("PIPED_KEY", None::<&str>, || {
        let _ = resolve_piped_key(None, Some(key_file.as_path()));
    });
});
