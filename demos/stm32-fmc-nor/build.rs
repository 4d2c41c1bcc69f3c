fn main() {
    // Put `memory.x` in our output directory and ensure it's on the linker search path.
    let out = std::env::var("OUT_DIR").unwrap();
    let out_dir = std::path::Path::new(&out);
    std::fs::copy("memory.x", out_dir.join("memory.x")).unwrap();
    println!("cargo:rustc-link-search={out}");
    println!("cargo:rerun-if-changed=memory.x");

    println!("cargo:rustc-link-arg=--nmagic");
    println!("cargo:rustc-link-arg=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");

    // Nothing in the loader image calls its entry points; keep them through --gc-sections.
    for symbol in [
        "Init",
        "UnInit",
        "EraseChip",
        "EraseSector",
        "ProgramPage",
        "Verify",
        "BlankCheck",
    ] {
        println!("cargo:rustc-link-arg-bin=flm=--undefined={symbol}");
    }
}
