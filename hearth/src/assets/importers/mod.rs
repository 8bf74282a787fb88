//! Built-in asset type importers.
//!
//! The loader dispatches through these per-type function tables; each
//! importer turns a source file into a `LoadResult` (GPU handle or CPU
//! object) through the renderer and scene store.

pub mod material;
pub mod model;
pub mod scene;
pub mod shader;
pub mod skybox;
pub mod static_mesh;
pub mod texture;

use std::sync::Arc;

use super::registry::AssetManager;

/// Register the engine's asset types, in the order the type table indexes
/// them.
pub fn register_builtin_types(manager: &Arc<AssetManager>) {
    manager.register_asset(
        "texture",
        &["png", "jpeg", "jpg", "tga", "psd"],
        texture::load_texture,
        texture::unload_texture,
        None,
    );
    manager.register_asset(
        "environment_map",
        &["hdr"],
        texture::load_environment_map,
        texture::unload_texture,
        None,
    );
    manager.register_asset(
        "shader",
        &["glsl"],
        shader::load_shader,
        shader::unload_shader,
        None,
    );
    manager.register_asset(
        "material",
        &["hamaterial"],
        material::load_material,
        material::unload_material,
        Some(material::on_import_material),
    );
    manager.register_asset(
        "static_mesh",
        &["hastaticmesh"],
        static_mesh::load_static_mesh,
        static_mesh::unload_static_mesh,
        None,
    );
    manager.register_asset(
        "model",
        &["gltf", "glb"],
        model::load_model,
        model::unload_model,
        Some(model::on_import_model),
    );
    manager.register_asset(
        "skybox",
        &["haskybox"],
        skybox::load_skybox,
        skybox::unload_skybox,
        None,
    );
    manager.register_asset(
        "scene",
        &["hascene"],
        scene::load_scene,
        scene::unload_scene,
        None,
    );
}

/// Whitespace-token cursor over a text asset, with byte-exact reads for
/// length-prefixed strings.
pub(crate) struct TextCursor<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> TextCursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, position: 0 }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.position..];
        let trimmed = rest.trim_start();
        self.position += rest.len() - trimmed.len();
    }

    pub fn token(&mut self) -> anyhow::Result<&'a str> {
        self.skip_whitespace();
        let rest = &self.text[self.position..];
        anyhow::ensure!(!rest.is_empty(), "unexpected end of file");
        let end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        self.position += end;
        Ok(&rest[..end])
    }

    pub fn expect(&mut self, name: &str) -> anyhow::Result<()> {
        let token = self.token()?;
        anyhow::ensure!(token == name, "expected `{name}`, found `{token}`");
        Ok(())
    }

    /// `name value` record: checks the name, returns the value token.
    pub fn value_of(&mut self, name: &str) -> anyhow::Result<&'a str> {
        self.expect(name)?;
        self.token()
    }

    pub fn parse_value_of<T: std::str::FromStr>(&mut self, name: &str) -> anyhow::Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Ok(self.value_of(name)?.parse()?)
    }

    pub fn parse<T: std::str::FromStr>(&mut self) -> anyhow::Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Ok(self.token()?.parse()?)
    }

    /// Exactly `length` bytes after one separating whitespace character;
    /// used for strings that may themselves contain whitespace.
    pub fn take_bytes(&mut self, length: usize) -> anyhow::Result<&'a str> {
        let rest = &self.text[self.position..];
        let rest = rest.strip_prefix([' ', '\n', '\t', '\r']).unwrap_or(rest);
        self.position = self.text.len() - rest.len();
        anyhow::ensure!(
            rest.len() >= length && rest.is_char_boundary(length),
            "unexpected end of file"
        );
        let taken = &rest[..length];
        self.position += length;
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reads_name_value_records() {
        let mut cursor = TextCursor::new("version 1\ncount 3\n");
        assert_eq!(cursor.parse_value_of::<u32>("version").unwrap(), 1);
        assert_eq!(cursor.parse_value_of::<u32>("count").unwrap(), 3);
        assert!(cursor.token().is_err());
    }

    #[test]
    fn cursor_takes_exact_bytes() {
        let mut cursor = TextCursor::new("node_name 9 root node\nparent -1");
        cursor.expect("node_name").unwrap();
        let length: usize = cursor.parse().unwrap();
        assert_eq!(cursor.take_bytes(length).unwrap(), "root node");
        assert_eq!(cursor.parse_value_of::<i32>("parent").unwrap(), -1);
    }

    #[test]
    fn cursor_rejects_wrong_name() {
        let mut cursor = TextCursor::new("version 1");
        assert!(cursor.value_of("type").is_err());
    }
}
