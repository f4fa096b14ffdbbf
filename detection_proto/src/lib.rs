//! Wire contract of the detection service, generated from
//! `proto/detection_service.proto` at build time. Only the client is built.

tonic::include_proto!("detection_service");
