//! Asset path normalization and the embedded-path grammar.
//!
//! All registry paths are forward-slash normalized and relative to the
//! asset root. Embedded assets use the logical form
//! `@<embedder-uuid>-<data-id>/<name>.<ext>`.

use super::AssetHandle;

/// Normalize a path for registry storage. Idempotent.
pub fn sanitize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for mut ch in path.trim().chars() {
        if ch == '\\' {
            ch = '/';
        }
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    let out = out.strip_prefix("./").unwrap_or(&out);
    out.trim_end_matches('/').to_string()
}

/// Final path component, extension included.
pub fn name_with_extension(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Final path component without its extension.
pub fn name(path: &str) -> &str {
    let name = name_with_extension(path);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

/// File extension, lowercase-sensitive as stored; empty for directories.
pub fn extension(path: &str) -> &str {
    let name = name_with_extension(path);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[dot + 1..],
        _ => "",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedPath {
    pub embedder: AssetHandle,
    pub data_id: u64,
    pub name: String,
}

/// Parse `@<u64>-<u64>/<name>`; `None` when the path is not embedded.
pub fn parse_embedded(path: &str) -> Option<EmbeddedPath> {
    let rest = path.strip_prefix('@')?;
    let (ids, name) = rest.split_once('/')?;
    let (embedder, data_id) = ids.split_once('-')?;
    let embedder: u64 = embedder.parse().ok()?;
    let data_id: u64 = data_id.parse().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(EmbeddedPath {
        embedder: AssetHandle(embedder),
        data_id,
        name: name.to_string(),
    })
}

pub fn is_embedded(path: &str) -> bool {
    parse_embedded(path).is_some()
}

pub fn format_embedded(embedder: AssetHandle, data_id: u64, name: &str) -> String {
    format!("@{}-{}/{}", embedder.0, data_id, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_normalizes_separators() {
        assert_eq!(sanitize_path("textures\\wood.png"), "textures/wood.png");
        assert_eq!(sanitize_path("./models//house.gltf"), "models/house.gltf");
        assert_eq!(sanitize_path("  a/b.png "), "a/b.png");
        assert_eq!(sanitize_path("dir/"), "dir");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["textures\\wood.png", "./a//b/c.glsl", "plain.png", "@7-0/m.hamaterial"] {
            let once = sanitize_path(input);
            assert_eq!(sanitize_path(&once), once);
        }
    }

    #[test]
    fn name_and_extension_helpers() {
        assert_eq!(name_with_extension("a/b/wood.png"), "wood.png");
        assert_eq!(name("a/b/wood.png"), "wood");
        assert_eq!(extension("a/b/wood.png"), "png");
        assert_eq!(extension("a/directory"), "");
        assert_eq!(extension(".hidden"), "");
    }

    #[test]
    fn embedded_grammar_round_trip() {
        let formatted = format_embedded(AssetHandle(81943), 2, "material_2.hamaterial");
        assert_eq!(formatted, "@81943-2/material_2.hamaterial");
        let parsed = parse_embedded(&formatted).unwrap();
        assert_eq!(parsed.embedder, AssetHandle(81943));
        assert_eq!(parsed.data_id, 2);
        assert_eq!(parsed.name, "material_2.hamaterial");
    }

    #[test]
    fn embedded_rejects_malformed() {
        assert!(parse_embedded("wood.png").is_none());
        assert!(parse_embedded("@x-1/m").is_none());
        assert!(parse_embedded("@1-2").is_none());
        assert!(parse_embedded("@1-2/").is_none());
    }
}
