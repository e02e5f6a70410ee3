// @generated
// This file wires up buf-generated protobuf code
// Note: The prost files already include!() the tonic files automatically

pub mod echo {
    include!("echo.v1.rs");
    // echo.v1.tonic.rs is auto-included by echo.v1.rs
}
