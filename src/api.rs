pub mod v1 {
  tonic::include_proto!("log.v1");
}
