use std::{env, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=XGBOOST_LIB_DIR");

    // Without XGBOOST_LIB_DIR we rely on the system linker search path
    // (e.g. libxgboost installed under /usr/local/lib).
    let Some(lib_dir) = env::var_os("XGBOOST_LIB_DIR").map(PathBuf::from) else {
        println!("cargo:warning=XGBOOST_LIB_DIR not set, linking libxgboost from system paths");
        println!("cargo:rustc-link-lib=dylib=xgboost");
        return;
    };

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=dylib=xgboost");
    println!("cargo:rustc-link-arg=-Wl,-rpath,{}", lib_dir.display());

    // pip wheels ship libgomp & friends next to the package:
    // lib_dir = .../site-packages/xgboost/lib -> .../site-packages/xgboost.libs
    if let Some(site_packages) = lib_dir.parent().and_then(|p| p.parent()) {
        let libs_dir = site_packages.join("xgboost.libs");
        if libs_dir.exists() {
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", libs_dir.display());
        }
    }
}
