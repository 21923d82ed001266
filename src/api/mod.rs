//! History-service request surface and wire codecs.

pub mod codec;
pub mod requests;

pub use codec::{BlobDecodeError, BlobEncodeError, decode_history_blob, encode_history_blob};
pub use requests::{
    BlobEncoding, DlqMessage, DlqType, GetDlqReplicationMessagesRequest,
    GetReplicationMessagesRequest,
    GetReplicationMessagesResponse, HistoryBlob, MergeDlqMessagesRequest,
    MergeDlqMessagesResponse, PollMutableStateRequest, PollMutableStateResponse,
    PurgeDlqMessagesRequest, ReadDlqMessagesRequest, ReadDlqMessagesResponse,
    ReapplyEventsRequest, RefreshWorkflowTasksRequest, ReplicateEventsRequest,
    ReplicateEventsV2Request, ReplicateRawEventsRequest, ReplicationMessages, ReplicationToken,
    SyncActivityRequest, SyncShardStatusRequest, WorkflowExecution,
};
