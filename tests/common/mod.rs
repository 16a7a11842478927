#![allow(dead_code)]

use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bunker_mesh::glb::GlbDocument;
use bunker_mesh::pipeline::{PipelineConfig, ToolSet};
use bunker_mesh::sandbox::ToolPath;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;

pub const TEXTURE_SIZE: u32 = 64;

/// Temp layout shared by the pipeline tests.
pub struct Workspace {
    pub root: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path) -> Self {
        let workspace = Self {
            root: root.to_path_buf(),
            input_dir: root.join("incoming"),
            output_dir: root.join("published"),
            work_dir: root.join("work"),
            bin_dir: root.join("bin"),
        };
        for dir in [
            &workspace.input_dir,
            &workspace.output_dir,
            &workspace.work_dir,
            &workspace.bin_dir,
        ] {
            fs::create_dir_all(dir).unwrap();
        }
        workspace
    }

    pub fn write_input(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.input_dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// `gltf-transform` stand-in that copies its input for `draco` and `simplify`.
    pub fn copying_gltf_transform(&self) -> PathBuf {
        self.script(
            "gltf-transform",
            "#!/bin/sh\ncase \"$1\" in\n  draco|simplify) exec cp \"$2\" \"$3\" ;;\n  *) echo \"unknown command $1\" >&2; exit 2 ;;\nesac\n",
        )
    }

    /// `gltf-transform` stand-in whose every output is `glb`, whatever the input.
    pub fn emitting_gltf_transform(&self, glb: &[u8]) -> PathBuf {
        let fixture = self.bin_dir.join("emitted.glb");
        fs::write(&fixture, glb).unwrap();
        self.script(
            "gltf-transform",
            &format!(
                "#!/bin/sh\ncase \"$1\" in\n  draco|simplify) exec cp \"{}\" \"$3\" ;;\n  *) exit 2 ;;\nesac\n",
                fixture.display()
            ),
        )
    }

    pub fn failing_gltf_transform(&self, code: i32) -> PathBuf {
        self.script(
            "gltf-transform",
            &format!("#!/bin/sh\necho \"mesh is broken\" >&2\nexit {code}\n"),
        )
    }

    /// `magick` stand-in that replaces every texture with a flat PNG, except
    /// sources whose file name matches `fail_glob`.
    pub fn magick(&self, fail_glob: Option<&str>) -> PathBuf {
        let flat = self.bin_dir.join("flat.png");
        RgbImage::from_pixel(TEXTURE_SIZE, TEXTURE_SIZE, Rgb([90, 120, 200]))
            .save(&flat)
            .unwrap();
        let failure = fail_glob
            .map(|pattern| {
                format!("case \"$1\" in\n  {pattern}) echo \"cannot decode\" >&2; exit 1 ;;\nesac\n")
            })
            .unwrap_or_default();
        self.script(
            "magick",
            &format!("#!/bin/sh\n{failure}exec cp \"{}\" \"$5\"\n", flat.display()),
        )
    }

    /// `magick` stand-in that never finishes on its own.
    pub fn sleeping_magick(&self) -> PathBuf {
        self.script("magick", "#!/bin/sh\nexec sleep 30\n")
    }

    /// `magick` stand-in that writes `bytes` zeros to its output.
    pub fn flooding_magick(&self, bytes: u64) -> PathBuf {
        self.script(
            "magick",
            &format!("#!/bin/sh\nexec head -c {bytes} /dev/zero > \"$5\"\n"),
        )
    }

    pub fn config(&self, gltf_transform: &Path, magick: &Path) -> PipelineConfig {
        let tools = ToolSet {
            gltf_transform: ToolPath::new(gltf_transform).unwrap(),
            magick: ToolPath::new(magick).unwrap(),
        };
        let mut config =
            PipelineConfig::new(&self.input_dir, &self.output_dir, &self.work_dir, tools);
        config.limits.max_concurrency = 2;
        config
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin_dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

/// Incompressible PNG: every pixel comes from a small LCG.
pub fn noisy_png(seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let image = RgbImage::from_fn(TEXTURE_SIZE, TEXTURE_SIZE, |_, _| {
        let mut channel = || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        };
        Rgb([channel(), channel(), channel()])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// GLB whose BIN chunk embeds one noisy PNG per entry of `seeds`.
pub fn textured_glb(seeds: &[u32]) -> Vec<u8> {
    let mut bin = Vec::new();
    let mut views = Vec::new();
    let mut images = Vec::new();
    for (index, seed) in seeds.iter().enumerate() {
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let png = noisy_png(*seed);
        views.push(json!({ "buffer": 0, "byteOffset": bin.len(), "byteLength": png.len() }));
        images.push(json!({ "bufferView": index, "mimeType": "image/png" }));
        bin.extend_from_slice(&png);
    }
    let textures: Vec<_> = (0..seeds.len()).map(|index| json!({ "source": index })).collect();
    GlbDocument::new(
        json!({
            "asset": { "version": "2.0", "generator": "fixture" },
            "scenes": [{ "nodes": [] }],
            "scene": 0,
            "buffers": [{ "byteLength": bin.len() }],
            "bufferViews": views,
            "images": images,
            "textures": textures
        }),
        Some(bin),
    )
    .to_bytes()
    .unwrap()
}

pub fn forged_length(mut bytes: Vec<u8>) -> Vec<u8> {
    let forged = (bytes.len() as u32 + 128).to_le_bytes();
    bytes[8..12].copy_from_slice(&forged);
    bytes
}

pub fn glb_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(glb_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "glb") {
            found.push(path);
        }
    }
    found.sort();
    found
}
