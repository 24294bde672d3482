fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "proto/sum.proto";
    println!("cargo:rerun-if-changed={}", proto_file);
    println!("cargo:rerun-if-changed=proto");

    // Use the vendored protoc binary so the build works without a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .expect("protoc-bin-vendored: could not locate vendored protoc binary");
    std::env::set_var("PROTOC", protoc);

    // Ordered maps keep the encoded form of a record deterministic, which the
    // conflict resolver relies on when hashing record contents.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .btree_map(["."])
        .compile_protos(&[proto_file], &["proto"])?;

    Ok(())
}
