pub mod mock_rpc;
pub mod mock_source;
