//! Gateway services: route resolution, upstream transport, uploads and
//! object-store presigning.

pub mod presign;
pub mod provider_adapter;
pub mod route_table;
pub mod upload_service;

pub use presign::{ObjectStorePresigner, PresignedUpload};
pub use provider_adapter::{
    build_outgoing, HttpProviderAdapter, IncomingRequest, OutgoingRequest, ProviderAdapter,
    RequestBody, UpstreamResponse,
};
pub use route_table::{PathRule, RouteEntry, RouteMatch, RouteTable};
pub use upload_service::{UploadBackendKind, UploadResult, UploadService, UploadedFile};
