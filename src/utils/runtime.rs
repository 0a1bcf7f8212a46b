use std::process;

pub fn ensure_posix_or_exit() {
    if !is_supported_platform() {
        eprintln!(
            "unsupported platform: {} relies on POSIX sockets and signals",
            env!("CARGO_PKG_NAME")
        );
        process::exit(2);
    }
}

fn is_supported_platform() -> bool {
    cfg!(unix)
}
