use std::path::Path;

/// GPU encode families the local rewrite targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuKind {
    Nvenc,
    Qsv,
}

impl GpuKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
        }
    }
}

const NVIDIA_DEV: &str = "/dev/nvidia0";
const DRI_RENDER_DEV: &str = "/dev/dri/renderD128";

/// Detect the host GPU by device node. NVENC wins when both exist.
pub fn detect() -> Option<GpuKind> {
    detect_at(Path::new(NVIDIA_DEV), Path::new(DRI_RENDER_DEV))
}

pub fn detect_at(nvidia_dev: &Path, dri_render_dev: &Path) -> Option<GpuKind> {
    if nvidia_dev.exists() {
        Some(GpuKind::Nvenc)
    } else if dri_render_dev.exists() {
        Some(GpuKind::Qsv)
    } else {
        None
    }
}

/// The rewrite only applies when the argv actually asks for a software
/// encoder we know how to substitute.
pub fn uses_software_encoder(args: &[String]) -> bool {
    args.iter()
        .any(|arg| arg == "libx264" || arg == "libx265")
}
