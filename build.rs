//! Build script for pfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `pfw --version` and the startup log line.

fn main() {
    println!("cargo:rerun-if-env-changed=PFW_NFT_COMMAND");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
