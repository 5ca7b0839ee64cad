use std::fs;

fn main() {
    // reqwest version extraction, advertised in the store client's user agent
    let reqwest_version = fs::read_to_string("Cargo.lock")
        .ok()
        .and_then(|lock| toml::from_str::<toml::Value>(&lock).ok())
        .and_then(|lockfile| {
            lockfile
                .get("package")?
                .as_array()?
                .iter()
                .find(|pkg| pkg.get("name").and_then(toml::Value::as_str) == Some("reqwest"))
                .and_then(|pkg| pkg.get("version").and_then(toml::Value::as_str))
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=REQWEST_VERSION={reqwest_version}");
    println!("cargo:rerun-if-changed=Cargo.lock");
}
