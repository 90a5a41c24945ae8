//! End-to-end boot tests against mock page servers.

mod common;

use {
    common::{init_logs, wait_until, MockPageServer},
    pagelink::{
        ActiveTranServer, ConnState, ConnType, TranServer, TranServerConfig, TranServerError,
    },
    std::time::Duration,
};

const WAIT: Duration = Duration::from_secs(3);

fn ats_config(hosts: String, remote_storage: bool) -> TranServerConfig {
    let mut config = TranServerConfig::dev_default();
    config.page_server_hosts = hosts;
    config.remote_storage = remote_storage;
    config
}

#[test]
fn test_boot_happy_path_two_page_servers() {
    init_logs();
    let ps1 = MockPageServer::start();
    let ps2 = MockPageServer::start();
    let hosts = format!("{},{}", ps1.hosts_entry(), ps2.hosts_entry());

    let server = ActiveTranServer::new(ats_config(hosts, true));
    server.boot("testdb").unwrap();

    let handlers = server.connection_handlers();
    assert_eq!(handlers.len(), 2);
    assert!(wait_until(WAIT, || handlers
        .iter()
        .all(|handler| handler.is_connected())));

    // Registration order decides the main connection.
    assert_eq!(
        server.main_connection_info(),
        Some(("127.0.0.1".to_string(), i32::from(ps1.port())))
    );
    assert!(server.is_page_server_connected());
    assert!(server.uses_remote_storage());

    // Both page servers saw the boot-time catchup request; with no main
    // connection yet it carries the placeholder origin.
    assert!(wait_until(WAIT, || !ps1.catchup_requests().is_empty()));
    let request = &ps1.catchup_requests()[0];
    assert_eq!(request.host, "N/A");
    assert_eq!(request.port, -1);
    assert!(request.catchup_lsa.is_null());
    assert!(!ps2.catchup_requests().is_empty());

    server.shutdown();
    // Graceful shutdown announces itself to every page server.
    assert!(wait_until(WAIT, || ps1.disconnect_msg_count() == 1));
    assert!(wait_until(WAIT, || ps2.disconnect_msg_count() == 1));
}

#[test]
fn test_boot_partial_failure_without_remote_storage() {
    init_logs();
    let ps1 = MockPageServer::start();
    let ps2 = MockPageServer::start();
    ps1.set_accepting(false);
    let hosts = format!("{},{}", ps1.hosts_entry(), ps2.hosts_entry());

    let server = ActiveTranServer::new(ats_config(hosts, false));
    server.boot("testdb").unwrap();

    let handlers = server.connection_handlers();
    assert!(wait_until(WAIT, || handlers[1].is_connected()));
    assert_eq!(
        server.main_connection_info(),
        Some(("127.0.0.1".to_string(), i32::from(ps2.port())))
    );
}

#[test]
fn test_boot_partial_failure_with_remote_storage() {
    init_logs();
    let ps1 = MockPageServer::start();
    let ps2 = MockPageServer::start();
    ps1.set_accepting(false);
    let hosts = format!("{},{}", ps1.hosts_entry(), ps2.hosts_entry());

    let server = ActiveTranServer::new(ats_config(hosts, true));
    // One page server accepted, which is enough for remote storage.
    server.boot("testdb").unwrap();
    assert!(server.is_page_server_connected());
}

#[test]
fn test_boot_all_refused_with_remote_storage() {
    init_logs();
    let ps1 = MockPageServer::start();
    ps1.set_accepting(false);

    let server = ActiveTranServer::new(ats_config(ps1.hosts_entry(), true));
    assert_eq!(
        server.boot("testdb").unwrap_err(),
        TranServerError::NoPageServerConnection
    );
}

#[test]
fn test_boot_rejects_handshake_echo_mismatch() {
    init_logs();
    let ps1 = MockPageServer::start();
    ps1.set_echo_delta(1);

    let server = ActiveTranServer::new(ats_config(ps1.hosts_entry(), true));
    assert_eq!(
        server.boot("testdb").unwrap_err(),
        TranServerError::NoPageServerConnection
    );
    assert!(!server.is_page_server_connected());
}

#[test]
fn test_bad_host_tokens_are_skipped_at_boot() {
    init_logs();
    let ps1 = MockPageServer::start();
    // The malformed entries are rejected, the good one still boots.
    let hosts = format!(":80,{},b:-1", ps1.hosts_entry());

    let server = ActiveTranServer::new(ats_config(hosts, true));
    server.boot("testdb").unwrap();
    assert_eq!(server.connection_handlers().len(), 1);
    assert!(server.is_page_server_connected());
}

#[test]
fn test_base_variant_connects_without_catchup() {
    init_logs();
    let ps1 = MockPageServer::start();
    let mut config = TranServerConfig::dev_default();
    config.page_server_hosts = ps1.hosts_entry();

    let server = TranServer::new(config, ConnType::Passive);
    server.boot("testdb").unwrap();

    let handlers = server.connection_handlers();
    // The base variant flips straight to CONNECTED after the handshake.
    assert_eq!(handlers[0].state(), ConnState::Connected);
    assert!(ps1.catchup_requests().is_empty());
    assert_eq!(
        server.main_connection_info(),
        Some(("127.0.0.1".to_string(), i32::from(ps1.port())))
    );
}
