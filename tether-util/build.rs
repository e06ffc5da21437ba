//! Compile time configurations for the util crate
fn main() {
    // the TETHER_PKG_NAME variable is used to create local folders under
    // `~/.config`, `~/.local/state` and other directories. Do not change the name
    // unless you know what you are doing as this means any prior files will no longer
    // be accessible to the agent.
    println!("cargo::rustc-env=TETHER_PKG_NAME=tether");
}
