//! Registry of mounted applications and their clients.
//!
//! One `AppConfig` exists per app id, created on the first client mount and
//! torn down when the last client detaches. Per client it owns the opened
//! shared-memory regions (superblock, request buffer, reply buffer) and the
//! spill file handles. Entries are effectively immutable after mount;
//! readers clone the `Arc` and never hold the registry lock across I/O.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::common::{AppId, ClientId, ServerRank, SuperblockLayout};
use crate::server::external::ConnId;
use crate::utils::{ShmRegion, StagefsError};

/// Everything a client tells the delegator at mount time.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MountInfo {
    pub app_id: AppId,
    pub client_id: ClientId,
    /// The client process's rank in its own application, for diagnostics.
    pub dbg_rank: i32,
    pub layout: SuperblockLayout,
    pub super_name: String,
    pub req_name: String,
    pub req_buf_sz: usize,
    pub reply_name: String,
    pub recv_buf_sz: usize,
    pub spill_data_path: String,
    pub spill_index_path: String,
}

/// Per-client mounted state; owned by its `AppConfig`.
pub struct ClientSlot {
    pub client_id: ClientId,
    pub dbg_rank: i32,
    pub conn: ConnId,

    /// Superblock region mapped from the client's named segment.
    pub superblock: ShmRegion,
    /// Read-request region.
    pub req_buf: ShmRegion,
    /// Read-reply region.
    pub reply_buf: ShmRegion,

    /// Spillover data log, read positionally by the service manager.
    pub spill_data: File,
    /// Spillover index log (client-side durability; not read back here).
    pub spill_index: File,

    pub super_name: String,
    pub spill_data_path: String,
}

/// Per-application configuration: region layout shared by all of the app's
/// clients, plus the per-client slots.
pub struct AppConfig {
    pub app_id: AppId,
    pub layout: SuperblockLayout,
    pub req_buf_sz: usize,
    pub recv_buf_sz: usize,

    clients: RwLock<HashMap<ClientId, Arc<ClientSlot>>>,
}

impl AppConfig {
    pub(crate) fn new(
        app_id: AppId,
        layout: SuperblockLayout,
        req_buf_sz: usize,
        recv_buf_sz: usize,
    ) -> Self {
        AppConfig {
            app_id,
            layout,
            req_buf_sz,
            recv_buf_sz,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Registers one client slot under this app.
    pub(crate) fn register(&self, slot: Arc<ClientSlot>) {
        self.clients.write().unwrap().insert(slot.client_id, slot);
    }

    /// Looks up one mounted client of this app.
    pub fn client(&self, client_id: ClientId) -> Option<Arc<ClientSlot>> {
        self.clients.read().unwrap().get(&client_id).cloned()
    }

    /// Number of clients currently mounted under this app.
    pub fn num_clients(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

/// Registry of all mounted apps on this delegator.
pub struct AppRegistry {
    me: ServerRank,
    apps: RwLock<HashMap<AppId, Arc<AppConfig>>>,
}

impl AppRegistry {
    pub fn new(me: ServerRank) -> Self {
        AppRegistry {
            me,
            apps: RwLock::new(HashMap::new()),
        }
    }

    /// Mounts one client: opens its named shm regions and spill files and
    /// registers the slot. The first client of an app fixes the app's
    /// region layout; later mounts must agree with it.
    pub fn mount(
        &self,
        info: &MountInfo,
        conn: ConnId,
    ) -> Result<(), StagefsError> {
        let app = {
            let mut apps = self.apps.write().unwrap();
            apps.entry(info.app_id)
                .or_insert_with(|| {
                    Arc::new(AppConfig::new(
                        info.app_id,
                        info.layout,
                        info.req_buf_sz,
                        info.recv_buf_sz,
                    ))
                })
                .clone()
        };

        if app.layout != info.layout
            || app.req_buf_sz != info.req_buf_sz
            || app.recv_buf_sz != info.recv_buf_sz
        {
            return logged_err!(self.me;
                               "mount layout mismatch for app {}",
                               info.app_id);
        }
        if app.client(info.client_id).is_some() {
            return logged_err!(self.me;
                               "duplicate mount of app {} client {}",
                               info.app_id, info.client_id);
        }

        let superblock =
            ShmRegion::open(&info.super_name, info.layout.superblock_sz)?;
        let req_buf = ShmRegion::open(&info.req_name, info.req_buf_sz)?;
        let reply_buf = ShmRegion::open(&info.reply_name, info.recv_buf_sz)?;
        let spill_data =
            OpenOptions::new().read(true).open(&info.spill_data_path)?;
        let spill_index =
            OpenOptions::new().read(true).open(&info.spill_index_path)?;

        app.register(Arc::new(ClientSlot {
            client_id: info.client_id,
            dbg_rank: info.dbg_rank,
            conn,
            superblock,
            req_buf,
            reply_buf,
            spill_data,
            spill_index,
            super_name: info.super_name.clone(),
            spill_data_path: info.spill_data_path.clone(),
        }));

        pf_info!(self.me; "mounted app {} client {} (dbg_rank {})",
                 info.app_id, info.client_id, info.dbg_rank);
        Ok(())
    }

    /// Looks up one app.
    pub fn app(&self, app_id: AppId) -> Option<Arc<AppConfig>> {
        self.apps.read().unwrap().get(&app_id).cloned()
    }

    /// Looks up one mounted client.
    pub fn client(
        &self,
        app_id: AppId,
        client_id: ClientId,
    ) -> Option<(Arc<AppConfig>, Arc<ClientSlot>)> {
        let app = self.app(app_id)?;
        let slot = app.client(client_id)?;
        Some((app, slot))
    }

    /// Unmounts one client, dropping its shm mappings and spill handles.
    /// Returns true when this was the app's last client and the whole app
    /// entry was removed.
    pub fn unmount(
        &self,
        app_id: AppId,
        client_id: ClientId,
    ) -> Result<bool, StagefsError> {
        let Some(app) = self.app(app_id) else {
            return logged_err!(self.me; "unmount of unknown app {}", app_id);
        };
        if app.clients.write().unwrap().remove(&client_id).is_none() {
            return logged_err!(self.me;
                               "unmount of unknown client {} in app {}",
                               client_id, app_id);
        }

        let last = app.num_clients() == 0;
        if last {
            self.apps.write().unwrap().remove(&app_id);
        }
        pf_info!(self.me; "unmounted app {} client {}{}", app_id, client_id,
                 if last { ", app gone" } else { "" });
        Ok(last)
    }
}
