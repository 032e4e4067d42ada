use std::env;
use std::fs;
use std::path::Path;

const CONFIG_FILES: [&str; 2] = ["game_config.toml", "gamerunner.log.toml"];

fn main() {
    let source_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");

    let source_path = Path::new(&source_dir).join("config");

    // OUT_DIR sits three levels below the profile directory holding the binaries
    let target_path = Path::new(&out_dir)
        .ancestors()
        .nth(3)
        .expect("Failed navigating to the target directory");

    for name in CONFIG_FILES.iter() {
        println!("cargo:rerun-if-changed=config/{}", name);

        fs::copy(source_path.join(name), target_path.join(name))
            .unwrap_or_else(|error| panic!("Failed to copy {}: {}", name, error));
    }
}
