use std::env;

fn main() {
    // Banner and --version text; a tagged release build passes RELEASE_VERSION
    let release = env::var("RELEASE_VERSION").ok();
    let base = release
        .clone()
        .or_else(|| env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "0.0.0".to_string());

    let app_version = match (release, env::var("PROFILE").as_deref()) {
        (None, Ok("debug")) => format!("{base}-dev"),
        _ => base,
    };

    println!("cargo:rustc-env=APP_VERSION={app_version}");
    println!("cargo:rerun-if-env-changed=RELEASE_VERSION");
}
