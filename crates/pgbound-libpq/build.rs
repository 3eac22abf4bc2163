fn main() {
    // Only link libpq when the `libpq` feature is enabled. Otherwise this
    // crate compiles as a stub (all methods return errors or defaults).
    println!("cargo:rerun-if-env-changed=PQ_LIB_DIR");
    if std::env::var_os("CARGO_FEATURE_LIBPQ").is_none() {
        return;
    }

    if let Some(dir) = std::env::var_os("PQ_LIB_DIR") {
        println!(
            "cargo:rustc-link-search=native={}",
            std::path::Path::new(&dir).display()
        );
    }
    println!("cargo:rustc-link-lib=pq");
}
