//! End-to-end asset pipeline tests against the headless driver: import,
//! acquire/release accounting, hot reload, embedded models, scenes and
//! registry persistence.

use std::path::Path;
use std::sync::Arc;

use hearth::assets::importers::material::{
    write_material, MaterialProperty, MaterialPropertyValue, MaterialType, ParsedMaterial,
};
use hearth::assets::importers::scene as scene_importer;
use hearth::assets::importers::static_mesh::{write_static_mesh, ParsedStaticMesh};
use hearth::assets::{AssetHandle, AssetManager, AssetState, FileEvent, FileEventKind};
use hearth::jobs::JobPool;
use hearth::scene::{Component, MeshComponent, Scene, SceneStore, Transform, NO_NODE};
use hgal::driver::null::encode_shader_bytecode;
use hgal::driver::NullDriver;
use hgal::reflection::{
    BindGroupLayoutDescriptor, Binding, BindingType, ShaderDataType, ShaderReflection,
    ShaderStruct, ShaderStructMember, MATERIAL_PROPERTIES_STRUCT_NAME,
};
use hgal::renderer::Renderer;
use hgal::types::{CullMode, DepthStencilState, FrontFace, Material};

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    jobs: Arc<JobPool>,
    renderer: Arc<Renderer>,
    manager: Arc<AssetManager>,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let jobs = JobPool::new(4);
        let renderer = Arc::new(Renderer::new(Arc::new(NullDriver::default())).unwrap());
        let scenes = Arc::new(SceneStore::new());
        let manager =
            AssetManager::new(&root, jobs.clone(), renderer.clone(), scenes).unwrap();
        Self {
            _dir: dir,
            root,
            jobs,
            renderer,
            manager,
        }
    }

    fn reopen(&self) -> Arc<AssetManager> {
        AssetManager::new(
            &self.root,
            self.jobs.clone(),
            self.renderer.clone(),
            Arc::new(SceneStore::new()),
        )
        .unwrap()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.jobs.shutdown();
    }
}

fn material_shader_reflection() -> ShaderReflection {
    ShaderReflection {
        sets: vec![
            Some(Default::default()),
            Some(Default::default()),
            Some(BindGroupLayoutDescriptor {
                bindings: vec![Binding {
                    binding_type: BindingType::UniformBuffer,
                    number: 0,
                    count: 1,
                    stage_flags: 0b11,
                }],
            }),
        ],
        structs: vec![ShaderStruct {
            name: MATERIAL_PROPERTIES_STRUCT_NAME.into(),
            size: 28,
            members: vec![
                ShaderStructMember {
                    name: "albedo_color".into(),
                    data_type: ShaderDataType::Vector4F,
                    offset: 0,
                    is_array: false,
                    array_element_count: -1,
                },
                ShaderStructMember {
                    name: "metallic_factor".into(),
                    data_type: ShaderDataType::F32,
                    offset: 16,
                    is_array: false,
                    array_element_count: -1,
                },
                ShaderStructMember {
                    name: "roughness_factor".into(),
                    data_type: ShaderDataType::F32,
                    offset: 20,
                    is_array: false,
                    array_element_count: -1,
                },
                ShaderStructMember {
                    name: "albedo_texture".into(),
                    data_type: ShaderDataType::U32,
                    offset: 24,
                    is_array: false,
                    array_element_count: -1,
                },
            ],
        }],
        ..Default::default()
    }
}

fn write_shader_file(path: &Path) {
    std::fs::write(path, encode_shader_bytecode(&material_shader_reflection())).unwrap();
}

fn brick_material(shader: AssetHandle, albedo: glam::Vec4) -> ParsedMaterial {
    ParsedMaterial {
        version: 1,
        material_type: MaterialType::Opaque,
        shader,
        cull_mode: CullMode::Back,
        front_face: FrontFace::CounterClockwise,
        depth_stencil: DepthStencilState::default(),
        properties: vec![MaterialProperty {
            name: "albedo_color".into(),
            value: MaterialPropertyValue::V4F(albedo),
        }],
    }
}

fn triangle_mesh_file() -> String {
    write_static_mesh(&ParsedStaticMesh {
        version: 1,
        material_asset: AssetHandle(0),
        positions: vec![glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Y],
        normals: vec![glam::Vec3::Z; 3],
        uvs: vec![glam::Vec2::ZERO; 3],
        tangents: vec![glam::Vec4::X; 3],
        indices: vec![0, 1, 2],
    })
}

fn bump_mtime(path: &Path) {
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(later))
        .unwrap();
}

#[test]
fn import_is_idempotent() {
    let fixture = Fixture::new();
    std::fs::write(fixture.root.join("noise.glsl"), encode_shader_bytecode(&Default::default()))
        .unwrap();
    let first = fixture.manager.import_asset("noise.glsl");
    let second = fixture.manager.import_asset("noise.glsl");
    assert!(!first.is_none());
    assert_eq!(first, second);
}

#[test]
fn unknown_extension_yields_no_asset() {
    let fixture = Fixture::new();
    std::fs::write(fixture.root.join("readme.txt"), "hello").unwrap();
    assert_eq!(
        fixture.manager.try_import_asset("readme.txt").unwrap_err(),
        hearth::AssetError::UnknownAssetType("txt".into())
    );
    assert_eq!(
        fixture.manager.try_import_asset("missing.png").unwrap_err(),
        hearth::AssetError::NotFound("missing.png".into())
    );
    assert!(fixture.manager.import_asset("readme.txt").is_none());
}

#[test]
fn deleted_entry_keeps_uuid_and_reimport_reuses_it() {
    let fixture = Fixture::new();
    let file = fixture.root.join("lit.glsl");
    write_shader_file(&file);

    let original = fixture.manager.import_asset("lit.glsl");
    fixture.manager.process_file_event(FileEvent {
        path: "lit.glsl".into(),
        kind: FileEventKind::Deleted,
    });
    assert!(!fixture.manager.is_asset_handle_valid(original));
    assert!(fixture.manager.get_asset_handle("lit.glsl").is_none());
    // the tombstone still owns the uuid
    assert!(fixture.manager.entry(original).unwrap().is_deleted);

    // the file comes back under a new directory; same name, same uuid
    std::fs::create_dir_all(fixture.root.join("shaders")).unwrap();
    write_shader_file(&fixture.root.join("shaders/lit.glsl"));
    let reimported = fixture.manager.import_asset("shaders/lit.glsl");
    assert_eq!(reimported, original);
    let entry = fixture.manager.entry(original).unwrap();
    assert!(!entry.is_deleted);
    assert_eq!(entry.path, "shaders/lit.glsl");
}

#[test]
fn rename_updates_the_path_index() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("old.glsl"));
    let handle = fixture.manager.import_asset("old.glsl");

    fixture.manager.process_file_event(FileEvent {
        path: "old.glsl".into(),
        kind: FileEventKind::Renamed {
            new_path: "new.glsl".into(),
        },
    });
    assert!(fixture.manager.get_asset_handle("old.glsl").is_none());
    assert_eq!(fixture.manager.get_asset_handle("new.glsl"), handle);
    assert_eq!(fixture.manager.entry(handle).unwrap().path, "new.glsl");
}

#[test]
fn acquire_release_restores_preacquire_state() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let handle = fixture.manager.import_asset("lit.glsl");

    let before = fixture.manager.entry(handle).unwrap();
    let job = fixture.manager.acquire_asset(handle);
    fixture.manager.wait_for_asset(job);
    assert_eq!(fixture.manager.entry(handle).unwrap().state, AssetState::Loaded);
    assert!(fixture.manager.is_asset_loaded(handle));

    fixture.manager.release_asset(handle);
    let after = fixture.manager.entry(handle).unwrap();
    assert_eq!(after.ref_count, before.ref_count);
    assert_eq!(after.state, before.state);
    assert!(!fixture.manager.is_asset_loaded(handle));
}

#[test]
fn concurrent_acquires_load_once() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let handle = fixture.manager.import_asset("lit.glsl");

    let mut threads = Vec::new();
    for _ in 0..8 {
        let manager = fixture.manager.clone();
        threads.push(std::thread::spawn(move || {
            let job = manager.acquire_asset(handle);
            manager.wait_for_asset(job);
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    let entry = fixture.manager.entry(handle).unwrap();
    assert_eq!(entry.ref_count, 8);
    assert_eq!(entry.state, AssetState::Loaded);
    // one shader in the pool, not eight
    assert_eq!(fixture.renderer.shaders.len(), 1);

    for _ in 0..8 {
        fixture.manager.release_asset(handle);
    }
    assert_eq!(fixture.manager.entry(handle).unwrap().ref_count, 0);
}

#[test]
fn material_loads_through_its_shader_parent() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let shader = fixture.manager.import_asset("lit.glsl");

    let material_text = write_material(&brick_material(shader, glam::Vec4::ONE));
    std::fs::write(fixture.root.join("brick.hamaterial"), material_text).unwrap();
    let material = fixture.manager.import_asset("brick.hamaterial");

    // on_import parented the material to its shader
    assert_eq!(fixture.manager.entry(material).unwrap().parent, shader);

    let job = fixture.manager.acquire_asset(material);
    fixture.manager.wait_for_asset(job);
    assert_eq!(fixture.manager.entry(shader).unwrap().state, AssetState::Loaded);
    assert_eq!(fixture.manager.entry(material).unwrap().state, AssetState::Loaded);

    let gpu_material = fixture.manager.get_asset(material).gpu_handle::<Material>();
    let bytes = fixture
        .renderer
        .material_property_bytes(gpu_material, "albedo_color")
        .unwrap();
    assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
}

#[test]
fn modified_material_hot_reloads_with_stable_uuid() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let shader = fixture.manager.import_asset("lit.glsl");

    let file = fixture.root.join("brick.hamaterial");
    std::fs::write(&file, write_material(&brick_material(shader, glam::Vec4::ONE))).unwrap();
    let material = fixture.manager.import_asset("brick.hamaterial");

    let job = fixture.manager.acquire_asset(material);
    fixture.manager.wait_for_asset(job);
    let first = fixture.manager.get_asset(material).gpu_handle::<Material>();

    // edit albedo_color and touch the file
    std::fs::write(
        &file,
        write_material(&brick_material(shader, glam::Vec4::new(0.5, 0.2, 0.2, 1.0))),
    )
    .unwrap();
    bump_mtime(&file);
    fixture.manager.process_file_event(FileEvent {
        path: "brick.hamaterial".into(),
        kind: FileEventKind::Modified,
    });
    fixture.manager.reload_pending();
    fixture.jobs.wait_for_all_jobs_to_finish();

    // same uuid, republished handle, new property value
    let entry = fixture.manager.entry(material).unwrap();
    assert_eq!(entry.state, AssetState::Loaded);
    let second = fixture.manager.get_asset(material).gpu_handle::<Material>();
    assert!(fixture.renderer.materials.is_valid(&second));
    assert_ne!(first, second);
    let bytes = fixture
        .renderer
        .material_property_bytes(second, "albedo_color")
        .unwrap();
    assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());
}

#[test]
fn shader_reload_cascades_to_dependent_materials() {
    let fixture = Fixture::new();
    let shader_file = fixture.root.join("lit.glsl");
    write_shader_file(&shader_file);
    let shader = fixture.manager.import_asset("lit.glsl");

    std::fs::write(
        fixture.root.join("brick.hamaterial"),
        write_material(&brick_material(shader, glam::Vec4::ONE)),
    )
    .unwrap();
    let material = fixture.manager.import_asset("brick.hamaterial");

    let job = fixture.manager.acquire_asset(material);
    fixture.manager.wait_for_asset(job);
    let first_material = fixture.manager.get_asset(material).gpu_handle::<Material>();

    bump_mtime(&shader_file);
    fixture.manager.reload_asset(shader);
    fixture.jobs.wait_for_all_jobs_to_finish();

    // the material reloaded strictly after its shader
    assert_eq!(fixture.manager.entry(shader).unwrap().state, AssetState::Loaded);
    assert_eq!(fixture.manager.entry(material).unwrap().state, AssetState::Loaded);
    let second_material = fixture.manager.get_asset(material).gpu_handle::<Material>();
    assert_ne!(first_material, second_material);
}

fn write_gltf_fixture(root: &Path) {
    let mut bin: Vec<u8> = Vec::new();
    for value in [
        0.0f32, 0.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0,
    ] {
        bin.extend_from_slice(&value.to_le_bytes());
    }
    for index in [0u16, 1, 2] {
        bin.extend_from_slice(&index.to_le_bytes());
    }
    std::fs::write(root.join("house.bin"), &bin).unwrap();

    let json = r#"{
  "asset": { "version": "2.0" },
  "buffers": [{ "uri": "house.bin", "byteLength": 42 }],
  "bufferViews": [
    { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
    { "buffer": 0, "byteOffset": 36, "byteLength": 6 }
  ],
  "accessors": [
    { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0, 0, 0], "max": [1, 1, 0] },
    { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
  ],
  "materials": [
    { "pbrMetallicRoughness": { "baseColorFactor": [1, 0, 0, 1] } },
    { "pbrMetallicRoughness": { "baseColorFactor": [0, 1, 0, 1] } }
  ],
  "meshes": [
    { "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] },
    { "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] },
    { "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] }
  ]
}"#;
    std::fs::write(root.join("house.gltf"), json).unwrap();
}

#[test]
fn model_import_registers_embedded_children() {
    let fixture = Fixture::new();
    write_gltf_fixture(&fixture.root);

    let model = fixture.manager.import_asset("house.gltf");
    assert!(!model.is_none());

    let embedded = fixture.manager.get_embedded_assets(model);
    assert_eq!(embedded.len(), 5);
    for index in 0..2u64 {
        let path = format!("@{}-{index}/material_{index}.hamaterial", model.0);
        let child = fixture.manager.get_asset_handle(&path);
        assert!(!child.is_none());
        assert_eq!(fixture.manager.entry(child).unwrap().parent, model);
        assert_eq!(fixture.manager.asset_type_name(child).unwrap(), "material");
    }
    for index in 0..3u64 {
        let path = format!("@{}-{index}/static_mesh_{index}.hastaticmesh", model.0);
        let child = fixture.manager.get_asset_handle(&path);
        assert!(!child.is_none());
        assert_eq!(fixture.manager.asset_type_name(child).unwrap(), "static_mesh");
    }
}

#[test]
fn embedded_mesh_loads_with_model_as_dependency() {
    let fixture = Fixture::new();
    write_gltf_fixture(&fixture.root);

    let model = fixture.manager.import_asset("house.gltf");
    let mesh_path = format!("@{}-1/static_mesh_1.hastaticmesh", model.0);
    let mesh = fixture.manager.get_asset_handle(&mesh_path);

    let job = fixture.manager.acquire_asset(mesh);
    fixture.manager.wait_for_asset(job);
    fixture.jobs.wait_for_all_jobs_to_finish();

    // acquiring the child acquired and loaded the embedder first
    assert_eq!(fixture.manager.entry(model).unwrap().state, AssetState::Loaded);
    assert_eq!(fixture.manager.entry(model).unwrap().ref_count, 1);
    assert_eq!(fixture.manager.entry(mesh).unwrap().state, AssetState::Loaded);

    let gpu_mesh = fixture
        .manager
        .get_asset(mesh)
        .gpu_handle::<hgal::types::StaticMesh>();
    let counts = fixture
        .renderer
        .static_meshes
        .with(&gpu_mesh, |mesh| (mesh.vertex_count, mesh.index_count))
        .unwrap();
    assert_eq!(counts, (3, 3));
}

#[test]
fn scene_load_reference_accounting() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let shader = fixture.manager.import_asset("lit.glsl");

    let mut materials = Vec::new();
    for index in 0..4 {
        let name = format!("material_{index}.hamaterial");
        std::fs::write(
            fixture.root.join(&name),
            write_material(&brick_material(shader, glam::Vec4::ONE)),
        )
        .unwrap();
        materials.push(fixture.manager.import_asset(&name));
    }
    let mut meshes = Vec::new();
    for index in 0..3 {
        let name = format!("mesh_{index}.hastaticmesh");
        std::fs::write(fixture.root.join(&name), triangle_mesh_file()).unwrap();
        meshes.push(fixture.manager.import_asset(&name));
    }

    let mut scene = Scene::new("level");
    let root = scene.add_node("root", NO_NODE, vec![Component::Transform(Transform::default())]);
    scene.add_node(
        "a",
        root,
        vec![Component::Mesh(MeshComponent {
            static_mesh: meshes[0],
            materials: vec![materials[0], materials[1]],
        })],
    );
    scene.add_node(
        "b",
        root,
        vec![Component::Mesh(MeshComponent {
            static_mesh: meshes[1],
            materials: vec![materials[2]],
        })],
    );
    scene.add_node(
        "c",
        root,
        vec![Component::Mesh(MeshComponent {
            static_mesh: meshes[2],
            materials: vec![materials[3]],
        })],
    );
    std::fs::write(fixture.root.join("level.hascene"), scene_importer::write_scene(&scene)).unwrap();

    let scene_asset = fixture.manager.import_asset("level.hascene");
    let job = fixture.manager.acquire_asset(scene_asset);
    fixture.manager.wait_for_asset(job);
    fixture.jobs.wait_for_all_jobs_to_finish();

    for asset in materials.iter().chain(meshes.iter()) {
        assert_eq!(fixture.manager.entry(*asset).unwrap().ref_count, 1);
    }
    let scene_handle = fixture
        .manager
        .get_asset(scene_asset)
        .gpu_handle::<Scene>();
    assert!(fixture.manager.scenes().is_valid(&scene_handle));

    fixture.manager.release_asset(scene_asset);
    fixture.jobs.wait_for_all_jobs_to_finish();
    for asset in materials.iter().chain(meshes.iter()) {
        assert_eq!(fixture.manager.entry(*asset).unwrap().ref_count, 0);
        assert_eq!(fixture.manager.entry(*asset).unwrap().state, AssetState::Unloaded);
    }
    assert!(!fixture.manager.scenes().is_valid(&scene_handle));
    assert_eq!(fixture.manager.scenes().scene_count(), 0);
}

#[test]
fn registry_round_trips_through_disk() {
    let fixture = Fixture::new();
    write_shader_file(&fixture.root.join("lit.glsl"));
    let shader = fixture.manager.import_asset("lit.glsl");
    std::fs::write(
        fixture.root.join("brick.hamaterial"),
        write_material(&brick_material(shader, glam::Vec4::ONE)),
    )
    .unwrap();
    let material = fixture.manager.import_asset("brick.hamaterial");
    write_gltf_fixture(&fixture.root);
    let model = fixture.manager.import_asset("house.gltf");

    fixture.manager.serialize_registry().unwrap();

    let reopened = fixture.reopen();
    for handle in [shader, material, model] {
        let original = fixture.manager.entry(handle).unwrap();
        let restored = reopened.entry(handle).unwrap();
        assert_eq!(restored.path, original.path);
        assert_eq!(restored.parent, original.parent);
        assert!(!restored.is_deleted);
        assert_eq!(restored.state, AssetState::Unloaded);
    }
    // embedded children survive with their embedder relations
    let embedded = reopened.get_embedded_assets(model);
    assert_eq!(embedded.len(), 5);
    assert_eq!(
        reopened.get_asset_handle("brick.hamaterial"),
        material
    );
}

#[test]
fn failed_load_leaves_cache_empty_and_retryable() {
    let fixture = Fixture::new();
    let file = fixture.root.join("broken.hamaterial");
    std::fs::write(&file, "version 1\ngarbage").unwrap();
    let material = fixture.manager.import_asset("broken.hamaterial");

    let job = fixture.manager.acquire_asset(material);
    fixture.manager.wait_for_asset(job);
    let entry = fixture.manager.entry(material).unwrap();
    assert_eq!(entry.state, AssetState::FailedToLoad);
    assert_eq!(entry.ref_count, 1);
    assert!(!fixture.manager.get_asset(material).success);

    // fixing the file and modifying it recovers the asset
    write_shader_file(&fixture.root.join("lit.glsl"));
    let shader = fixture.manager.import_asset("lit.glsl");
    let loaded_shader = fixture.manager.acquire_asset(shader);
    fixture.manager.wait_for_asset(loaded_shader);

    std::fs::write(&file, write_material(&brick_material(shader, glam::Vec4::ONE))).unwrap();
    bump_mtime(&file);
    fixture.manager.process_file_event(FileEvent {
        path: "broken.hamaterial".into(),
        kind: FileEventKind::Modified,
    });
    fixture.manager.reload_pending();
    fixture.jobs.wait_for_all_jobs_to_finish();
    assert_eq!(
        fixture.manager.entry(material).unwrap().state,
        AssetState::Loaded
    );
}
