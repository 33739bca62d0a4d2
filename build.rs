fn main() {
    println!("cargo:rerun-if-env-changed=VLESSMUX_GIT_TAG");

    let build_version = std::env::var("VLESSMUX_GIT_TAG")
        .ok()
        .map(|v| v.trim().trim_start_matches('v').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    println!("cargo:rustc-env=VLESSMUX_BUILD_VERSION={build_version}");
}
