/// Builds the gRPC client and server code for the `callscope.proto` definition
/// using `tonic-prost-build`.
///
/// The generated module contains the `CallScope` service traits, the client
/// stub used by tests, and the `Request`/`Response` message types. A file
/// descriptor set is emitted alongside so the server can register gRPC
/// reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/callscope.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/callscope_descriptor.bin`
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
///
/// # Output
///
/// Generated code is included via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("callscope.v1");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("callscope_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/callscope.proto"], &["proto"])
        .unwrap();
}
