fn main() {
    // Release date for the plugin descriptor, taken from `date` so no
    // build dependency is needed.
    let output = std::process::Command::new("date")
        .args(["+%Y-%m-%d"])
        .output();
    let date = match output {
        Ok(out) if out.status.success() => String::from_utf8(out.stdout)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        _ => "unknown".to_string(),
    };
    println!("cargo:rustc-env=BUILD_REL_DATE={}", date);
    println!("cargo:rerun-if-changed=build.rs");
}
