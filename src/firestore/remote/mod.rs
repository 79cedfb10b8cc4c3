//! Everything that talks to the backend: the persistent listen and write
//! streams, watch change aggregation and the unary datastore calls.

pub mod bloom_filter;
pub mod connection;
pub mod connectivity_monitor;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use connection::{
    Connection, ConnectionArc, CredentialsProvider, CredentialsProviderArc,
    EmptyCredentialsProvider, RpcKind, StreamHandle, UnaryRpc,
};
pub use connectivity_monitor::{
    ConnectivityMonitor, ManualConnectivityMonitor, NetworkStatus, NoopConnectivityMonitor,
};
pub use datastore::{Datastore, DatastoreArc, RemoteDatastore};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use rpc_error::map_grpc_status;
pub use serializer::JsonProtoSerializer;
pub use stream::{loopback, LoopbackConnection, LoopbackServer};
