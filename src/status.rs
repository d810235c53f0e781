//! Coarse sync status: five orthogonal axes derived from internal signals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalRead {
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSave {
    Ready,
    Pending,
    Saving,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteConnect {
    Offline,
    Connecting,
    Online,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRead {
    Offline,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteSave {
    Ready,
    Pending,
    Saving,
    Error,
}

/// The product of the five axes. Subscribers receive a fresh value whenever
/// any axis changes; equal consecutive values are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub local_read: LocalRead,
    pub local_save: LocalSave,
    pub remote_connect: RemoteConnect,
    pub remote_read: RemoteRead,
    pub remote_save: RemoteSave,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            local_read: LocalRead::Loading,
            local_save: LocalSave::Ready,
            remote_connect: RemoteConnect::Offline,
            remote_read: RemoteRead::Offline,
            remote_save: RemoteSave::Ready,
        }
    }
}

/// Remote-side axes bundled for leader broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteState {
    pub connect: RemoteConnect,
    pub read: RemoteRead,
    pub save: RemoteSave,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            connect: RemoteConnect::Offline,
            read: RemoteRead::Offline,
            save: RemoteSave::Ready,
        }
    }
}
