//! Build script for tunwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `tunwall --version`.

fn main() {
    // Re-run build if the packager overrides the default nft binary
    println!("cargo:rerun-if-env-changed=TUNWALL_SYSTEM_NFT_PATH");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
