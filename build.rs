fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protobuf_src::protoc());

    prost_build::Config::new().compile_protos(&["proto/descriptor.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/descriptor.proto");

    Ok(())
}
