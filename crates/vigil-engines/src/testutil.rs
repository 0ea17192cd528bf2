//! Shared builders for engine unit tests.

use chrono::Utc;
use vigil_core::{PeInfo, ScanContext};

/// A minimal context for a non-PE file with no hashes.
pub fn plain_context(path: &str) -> ScanContext {
    ScanContext {
        path: path.into(),
        file_size: 4096,
        modified_at: Some(Utc::now()),
        created_at: Some(Utc::now() - chrono::Duration::days(30)),
        extension: std::path::Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default(),
        sha256: None,
        md5: None,
        pe_info: None,
        signer_name: None,
        signature_valid: None,
        location: Default::default(),
        prevalence: None,
    }
}

/// A context carrying a structurally valid, unremarkable PE.
pub fn pe_context(path: &str) -> ScanContext {
    let mut ctx = plain_context(path);
    ctx.file_size = 200 * 1024;
    ctx.pe_info = Some(PeInfo {
        valid: true,
        architecture: "x64".into(),
        section_names: vec![
            ".text".into(),
            ".data".into(),
            ".rdata".into(),
            ".rsrc".into(),
        ],
        imported_dlls: vec!["kernel32.dll".into(), "user32.dll".into()],
        imported_apis: vec!["CreateFileW".into(), "ReadFile".into()],
        entropy: 5.8,
        compile_timestamp: Some(Utc::now() - chrono::Duration::days(400)),
        has_signature: false,
        overlay_ratio: 0.0,
    });
    ctx
}
