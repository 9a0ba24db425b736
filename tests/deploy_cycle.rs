use kopl::config::ShellCredentials;
use kopl::deploy::{DeployOptions, Deployer, PluginSource};
use kopl::device::RemoteControlClient;
use kopl::version_gate::PluginInstaller;

mod util;
use util::{EventLog, FakeConnector, FakeDevice, MemoryFs, PluginFixture, event_log};

const REMOTE_ROOT: &str = "/mnt/us/koreader/plugins/hello.koplugin";

fn control_events(log: &EventLog) -> Vec<String> {
    log.borrow()
        .iter()
        .filter(|event| event.starts_with("GET ") || event.starts_with("ssh "))
        .cloned()
        .collect()
}

#[test]
fn full_cycle_runs_in_order() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::with_ssh(log.clone(), "[2222]", "[false]"));
    let fs = MemoryFs::new(log.clone());
    let connector = FakeConnector::new(log.clone(), fs.clone());
    let mut deployer = Deployer::new(
        &client,
        connector,
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let report = deployer.deploy(fixture.path()).unwrap();

    assert_eq!(report.files_transferred(), 3);
    assert_eq!(deployer.credentials().transport_port, Some(2222));
    assert!(fs.file(&format!("{REMOTE_ROOT}/main.lua")).is_some());
    assert_eq!(
        control_events(&log),
        vec![
            "GET ui/SSH/stop/",
            "GET ui/SSH/start/",
            "GET ui/SSH/SSH_port",
            "GET ui/SSH/allow_no_password",
            "GET ui/SSH/setAllowNoPassword/true",
            "ssh connect root@kindle:2222",
            "ssh close",
            "GET ui/SSH/setAllowNoPassword/false",
            "GET ui/SSH/stop/",
            "GET broadcast/Restart",
        ]
    );
}

#[test]
fn failed_upload_still_restores_and_restarts() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::with_ssh(log.clone(), "2222", "false"));
    let fs = MemoryFs::new(log.clone()).failing_create(&format!("{REMOTE_ROOT}/main.lua"));
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), fs),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let err = deployer.deploy(fixture.path()).unwrap_err();

    assert!(format!("{err:#}").contains("main.lua"), "{err:#}");
    let events = control_events(&log);
    assert_eq!(
        &events[events.len() - 4..],
        [
            "ssh close",
            "GET ui/SSH/setAllowNoPassword/false",
            "GET ui/SSH/stop/",
            "GET broadcast/Restart",
        ]
    );
}

#[test]
fn restore_failure_is_reported_after_successful_upload() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let device = FakeDevice::with_ssh(log.clone(), "2222", "false")
        .failing("ui/SSH/setAllowNoPassword/false");
    let client = RemoteControlClient::new(device);
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let err = deployer.deploy(fixture.path()).unwrap_err();

    assert!(format!("{err:#}").contains("restore"), "{err:#}");
    // The restart still happened.
    assert_eq!(
        control_events(&log).last().map(String::as_str),
        Some("GET broadcast/Restart")
    );
}

#[test]
fn restore_failure_never_masks_upload_error() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let device = FakeDevice::with_ssh(log.clone(), "2222", "false")
        .failing("ui/SSH/setAllowNoPassword/false");
    let client = RemoteControlClient::new(device);
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())).rejecting(),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let err = deployer.deploy(fixture.path()).unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("failed to open SSH session"), "{message}");
    assert!(!message.contains("restore"), "{message}");
}

#[test]
fn failed_negotiation_after_start_still_restarts() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let device = FakeDevice::with_ssh(log.clone(), "2222", "false")
        .failing("ui/SSH/setAllowNoPassword/true");
    let client = RemoteControlClient::new(device);
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let err = deployer.deploy(fixture.path()).unwrap_err();

    assert!(format!("{err:#}").contains("failed to prepare SSH"), "{err:#}");
    assert_eq!(
        control_events(&log),
        vec![
            "GET ui/SSH/stop/",
            "GET ui/SSH/start/",
            "GET ui/SSH/SSH_port",
            "GET ui/SSH/allow_no_password",
            "GET ui/SSH/setAllowNoPassword/true",
            "GET ui/SSH/setAllowNoPassword/false",
            "GET ui/SSH/stop/",
            "GET broadcast/Restart",
        ]
    );
}

#[test]
fn unreachable_device_is_not_restarted() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::new(log.clone()).failing("ui/SSH/stop/"));
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    deployer.deploy(fixture.path()).unwrap_err();

    assert_eq!(control_events(&log), vec!["GET ui/SSH/stop/"]);
}

#[test]
fn known_port_deploys_without_negotiation() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::new(log.clone()));
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())),
        "kindle",
        ShellCredentials::new("root").with_transport_port(Some(22)),
        DeployOptions::default(),
    );

    deployer.deploy(fixture.path()).unwrap();

    assert_eq!(
        control_events(&log),
        vec![
            "ssh connect root@kindle:22",
            "ssh close",
            "GET ui/SSH/stop/",
            "GET broadcast/Restart",
        ]
    );
}

#[test]
fn custom_deploy_path_and_installer_trait() {
    let fixture = PluginFixture::new();
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::with_ssh(log.clone(), "2222", "true"));
    let fs = MemoryFs::new(log.clone());
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), fs.clone()),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions {
            deploy_path: "/mnt/onboard/.adds/koreader/plugins/".to_string(),
            ..DeployOptions::default()
        },
    );

    deployer
        .install(&PluginSource::Local(fixture.path().to_path_buf()))
        .unwrap();

    assert!(
        fs.file("/mnt/onboard/.adds/koreader/plugins/hello.koplugin/_meta.lua")
            .is_some()
    );
}

#[test]
fn missing_local_source_fails_before_touching_device() {
    let log = event_log();
    let client = RemoteControlClient::new(FakeDevice::with_ssh(log.clone(), "2222", "false"));
    let mut deployer = Deployer::new(
        &client,
        FakeConnector::new(log.clone(), MemoryFs::new(log.clone())),
        "kindle",
        ShellCredentials::new("root"),
        DeployOptions::default(),
    );

    let tmp = tempfile::TempDir::new().unwrap();
    let err = deployer
        .deploy_source(&PluginSource::Local(tmp.path().join("nope")))
        .unwrap_err();

    assert!(format!("{err:#}").contains("not a directory"));
    assert!(log.borrow().is_empty());
}
