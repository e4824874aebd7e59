use std::path::{Path, PathBuf};

const APP_DIR: &str = "delaystation";

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/delaystation/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Unix socket path for one mpv channel.  Each channel gets its own socket so
/// the deck processes never share an IPC endpoint.
#[cfg(unix)]
pub fn mpv_socket_name(label: &str) -> String {
    format!(
        "{}/stationd-{}-{}.sock",
        temp_dir().display(),
        std::process::id(),
        label
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(label: &str) -> String {
    format!("stationd-{}-{}", std::process::id(), label)
}

#[cfg(unix)]
pub fn mpv_socket_arg(label: &str) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(label))
}

#[cfg(windows)]
pub fn mpv_socket_arg(label: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(label))
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

#[cfg(unix)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe"]
}

#[cfg(windows)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe.exe", "ffprobe"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

fn find_with_override(env_var: &str, names: &[&str]) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_var) {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    find_beside_exe(names).or_else(|| find_on_path(names))
}

/// Find mpv for playback channels.  `MPV_PATH` overrides the search.
pub fn find_mpv_binary() -> Option<PathBuf> {
    find_with_override("MPV_PATH", mpv_binary_names())
}

/// Find ffmpeg for recording and tail decoding.  `FFMPEG_PATH` overrides.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    find_with_override("FFMPEG_PATH", ffmpeg_binary_names())
}

/// Find ffprobe for duration probing fallback.  `FFPROBE_PATH` overrides.
pub fn find_ffprobe_binary() -> Option<PathBuf> {
    find_with_override("FFPROBE_PATH", ffprobe_binary_names())
}

/// File extensions treated as playable audio by the library scan and the
/// recordings index.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "opus", "flac", "m4a", "aac", "wav"];

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
