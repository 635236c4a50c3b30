fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    println!("cargo:rerun-if-env-changed=BUNSEN_GIT_HASH");
    if let Ok(hash) = std::env::var("BUNSEN_GIT_HASH") {
        println!("cargo:rustc-env=BUNSEN_GIT_HASH={}", hash);
    }
}
