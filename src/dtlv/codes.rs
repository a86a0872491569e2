// AVP code catalog.
//
// Codes below 100 live in the common namespace and are reserved for the
// system; every service owns the 100+ range inside its own namespace
// (namespace id == service id).

/// Service identities. The controller itself is service 1.
pub mod svc_id {
    pub const CONTROLLER: u16 = 1;
    pub const NTP: u16 = 3;
    pub const UDPCTL: u16 = 4;
    pub const LSH: u16 = 5;
    pub const SCHED: u16 = 8;
}

pub mod common {
    pub const APP_PRODUCT: u16 = 1;
    pub const APP_VERSION: u16 = 2;
    pub const RESULT_CODE: u16 = 3;
    pub const RESULT_MESSAGE: u16 = 4;
    pub const IPV4_ADDRESS: u16 = 5;
    pub const MAC48: u16 = 6;
    pub const IP_PORT: u16 = 7;
    pub const RESULT_EXT_CODE: u16 = 8;
    pub const EVENT_TIMESTAMP: u16 = 9;
    pub const SVC_MESSAGE: u16 = 10;
    pub const SVC_MESSAGE_TYPE: u16 = 11;
    pub const SVC_CONFIGURATION: u16 = 12;
    pub const HOST_NAME: u16 = 13;
    pub const TIME_ZONE: u16 = 14;
    pub const SERVICE_NAME: u16 = 15;
    pub const UPDATE_TIMESTAMP: u16 = 17;
    pub const OBJECT_SIZE: u16 = 18;
}

pub mod svcs {
    pub const SERVICE: u16 = 100;
    pub const SERVICE_ID: u16 = 101;
    pub const SERVICE_ENABLED: u16 = 103;
    pub const SERVICE_STATE: u16 = 104;
}

pub mod udpctl {
    pub const PROTOCOL: u16 = 100;
    pub const IDLE_TIMEOUT: u16 = 102;
    pub const AUTH_TIMEOUT: u16 = 103;
    pub const RECYCLE_TIMEOUT: u16 = 104;
    pub const SECRET: u16 = 105;
    pub const CLIENTS_LIMIT: u16 = 106;
    pub const CLIENT: u16 = 107;
    pub const CLIENT_STATE: u16 = 108;
    pub const CLIENT_FIRST_TIME: u16 = 109;
    pub const CLIENT_LAST_TIME: u16 = 110;
}

pub mod sh {
    pub const STATEMENT: u16 = 100;
    pub const STMT_OBJSIZE: u16 = 101;
    pub const STMT_NAME: u16 = 102;
    pub const STMT_TEXT: u16 = 103;
    pub const STMT_CODE: u16 = 104;
    pub const STMT_PARSE_TIME: u16 = 105;
    pub const STMT_ARGUMENTS: u16 = 106;
    pub const FUNCTION_NAME: u16 = 110;
}

pub mod sched {
    pub const ENTRY: u16 = 100;
    pub const ENTRY_NAME: u16 = 101;
    pub const ENTRY_STATE: u16 = 102;
    pub const SCHEDULE_STRING: u16 = 103;
    pub const STMT_NAME: u16 = 104;
    pub const STMT_ARGUMENTS: u16 = 105;
    pub const LAST_RUN_TIME: u16 = 106;
    pub const NEXT_RUN_TIME: u16 = 107;
    pub const RUN_COUNT: u16 = 108;
    pub const FAIL_COUNT: u16 = 109;
    pub const PERSISTENT: u16 = 110;
    pub const ENTRY_SOURCE: u16 = 111;
}

pub mod ntp {
    pub const PEER: u16 = 100;
    pub const POLL_INTERVAL: u16 = 101;
    pub const PEER_STATE: u16 = 102;
    pub const PEER_RTT_MEAN: u16 = 103;
    pub const LAST_ADJUST_TIME: u16 = 104;
    pub const LAST_OFFSET: u16 = 105;
}
