//! Topic names understood by the device firmware
//!
//! These are bit-exact; the device matches them as plain strings.

/// Auto-zoom feature topics (`autozoom/*`)
pub mod autozoom {
    pub const ENABLE: &str = "autozoom/enable";
    pub const DISABLE: &str = "autozoom/disable";
    pub const START: &str = "autozoom/start";
    pub const STOP: &str = "autozoom/stop";
    pub const STATUS: &str = "autozoom/status";
    pub const PREDICTIONS: &str = "autozoom/predictions";
}

/// Flash upgrader service topics
pub mod upgrader {
    pub const ALLOCATE: &str = "upgrader/allocate";
    pub const WRITE: &str = "upgrader/write";
    pub const WRITE_BUF: &str = "upgrader/write_buf";
    pub const CHECKSUM: &str = "upgrader/checksum";
    pub const ERASE_FLASH: &str = "upgrader/erase_flash";
    pub const WRITE_FLASH: &str = "upgrader/write_flash";
    pub const READ_FLASH: &str = "upgrader/read_flash";
    pub const MV_USB: &str = "upgrader/mv_usb";
    pub const STATUS: &str = "upgrader/status";
}

/// Package (hpk) upload and execution topics
pub mod package {
    pub const HCP_WRITE: &str = "hcp/write";
    pub const HPK_RUN: &str = "hpk/run";
}

pub mod prodinfo {
    pub const GET: &str = "prodinfo/get";
    pub const GET_MSGPACK: &str = "prodinfo/get_msgpack";
    pub const SET: &str = "prodinfo/set";
    pub const SET_MSGPACK: &str = "prodinfo/set_msgpack";
}

pub mod camctrl {
    pub const UPTIME: &str = "camctrl/uptime";
    pub const REBOOT: &str = "camctrl/reboot";
}

pub mod error_logger {
    pub const READ: &str = "error_logger/read";
    pub const ERASE: &str = "error_logger/erase";
}

/// Default prefix of the bulk-transfer sub-protocol topics
pub const ASYNC_FILE_TRANSFER: &str = "async_file_transfer";

/// Reply topic for a command (`<cmd>_reply`)
pub fn reply(command: &str) -> String {
    format!("{}_reply", command)
}

/// Completion topic for a long-running command (`<cmd>_done`)
pub fn done(command: &str) -> String {
    format!("{}_done", command)
}

/// Progress topic for a long-running command (`<cmd>_status`)
pub fn status(command: &str) -> String {
    format!("{}_status", command)
}
