//! Control of the supervised server process.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use zkherd_common::protocol::error::{Result, ZkherdError};

use crate::config::{InstanceConfig, IntConfig, StringConfig};
use crate::server_list::ServerType;

/// Start, stop and housekeeping for the supervised server.
///
/// Every operation receives the config this host should run with.
#[async_trait]
pub trait ProcessOperations: Send + Sync {
    async fn start_instance(&self, config: &InstanceConfig) -> Result<()>;

    /// Stops the server. Succeeds when nothing was running.
    async fn kill_instance(&self, config: &InstanceConfig) -> Result<()>;

    async fn cleanup_instance(&self, config: &InstanceConfig) -> Result<()>;
}

/// Drives a stock ZooKeeper installation through its `bin/` scripts.
pub struct StandardProcessOperations {
    hostname: String,
}

/// Output of `zkServer.sh stop` when no server was running.
const NOTHING_TO_STOP: &str = "no zookeeper to stop";

struct Paths {
    install: PathBuf,
    data: PathBuf,
}

impl Paths {
    fn from_config(config: &InstanceConfig) -> Result<Self> {
        if !config.is_runnable() {
            return Err(ZkherdError::ProcessControl(
                "install and data directories must both be configured".into(),
            ));
        }
        Ok(Self {
            install: PathBuf::from(config.string(StringConfig::ZookeeperInstallDirectory).trim()),
            data: PathBuf::from(config.string(StringConfig::ZookeeperDataDirectory).trim()),
        })
    }

    fn conf_dir(&self) -> PathBuf {
        self.install.join("conf")
    }

    fn script(&self, name: &str) -> PathBuf {
        self.install.join("bin").join(name)
    }
}

impl StandardProcessOperations {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Writes `zoo.cfg`, `myid` and `java.env` for `config`.
    pub async fn prepare_files(&self, config: &InstanceConfig) -> Result<()> {
        let paths = Paths::from_config(config)?;
        let conf_dir = paths.conf_dir();
        tokio::fs::create_dir_all(&conf_dir).await.map_err(io_error)?;
        tokio::fs::create_dir_all(&paths.data).await.map_err(io_error)?;

        tokio::fs::write(conf_dir.join("zoo.cfg"), render_zoo_cfg(config, &self.hostname))
            .await
            .map_err(io_error)?;

        let id_file = paths.data.join("myid");
        match config.server_list().find(&self.hostname) {
            Some(us) => {
                tokio::fs::write(&id_file, format!("{}\n", us.server_id))
                    .await
                    .map_err(io_error)?;
            }
            None => {
                info!("{} is not in the server list, starting standalone", self.hostname);
                match tokio::fs::remove_file(&id_file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(e)),
                }
            }
        }

        let java_env = config.string(StringConfig::JavaEnvironment);
        if !java_env.trim().is_empty() {
            tokio::fs::write(conf_dir.join("java.env"), java_env)
                .await
                .map_err(io_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessOperations for StandardProcessOperations {
    async fn start_instance(&self, config: &InstanceConfig) -> Result<()> {
        self.prepare_files(config).await?;
        let paths = Paths::from_config(config)?;
        let script = paths.script("zkServer.sh");
        run_script(&script, &["start"], &paths.install).await?;
        info!("Started server via {}", script.display());
        Ok(())
    }

    async fn kill_instance(&self, config: &InstanceConfig) -> Result<()> {
        let paths = Paths::from_config(config)?;
        let script = paths.script("zkServer.sh");
        match run_script(&script, &["stop"], &paths.install).await {
            Ok(_) => {
                info!("Stopped server via {}", script.display());
                Ok(())
            }
            Err(ZkherdError::ProcessControl(message))
                if message.to_ascii_lowercase().contains(NOTHING_TO_STOP) =>
            {
                info!("No server was running");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cleanup_instance(&self, config: &InstanceConfig) -> Result<()> {
        let paths = Paths::from_config(config)?;
        let max_files = config.uint(IntConfig::CleanupMaxFiles).max(3).to_string();
        let data = paths.data.to_string_lossy().into_owned();
        run_script(
            &paths.script("zkCleanup.sh"),
            &[data.as_str(), "-n", max_files.as_str()],
            &paths.install,
        )
        .await?;
        info!("Cleaned up {} keeping {} snapshots", data, max_files);
        Ok(())
    }
}

/// Renders `zoo.cfg` for `hostname`.
///
/// `zoo-cfg-extra` supplies free-form `key=value` pairs separated by `&`;
/// the managed keys are written after them and win on conflict.
pub fn render_zoo_cfg(config: &InstanceConfig, hostname: &str) -> String {
    let mut out = String::from("# Generated by zkherd\n");

    for pair in config
        .string(StringConfig::ZooCfgExtra)
        .split('&')
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        match pair.split_once('=') {
            Some((key, value)) if !is_managed_key(key.trim()) => {
                out.push_str(&format!("{}={}\n", key.trim(), value.trim()));
            }
            Some(_) => debug!("Ignoring managed key in zoo-cfg-extra: {}", pair),
            None => debug!("Ignoring malformed zoo-cfg-extra item: {}", pair),
        }
    }

    out.push_str(&format!(
        "dataDir={}\n",
        config.string(StringConfig::ZookeeperDataDirectory).trim()
    ));
    out.push_str(&format!("clientPort={}\n", config.port(IntConfig::ClientPort)));

    let servers = config.server_list();
    let connect = config.port(IntConfig::ConnectPort);
    let election = config.port(IntConfig::ElectionPort);
    for spec in servers.specs() {
        out.push_str(&format!(
            "server.{}={}:{}:{}{}\n",
            spec.server_id,
            spec.hostname,
            connect,
            election,
            spec.server_type.zoo_cfg_suffix()
        ));
    }

    if matches!(servers.find(hostname), Some(us) if us.server_type == ServerType::Observer) {
        out.push_str("peerType=observer\n");
    }

    out
}

fn is_managed_key(key: &str) -> bool {
    key == "dataDir" || key == "clientPort" || key == "peerType" || key.starts_with("server.")
}

async fn run_script(script: &Path, args: &[&str], cwd: &Path) -> Result<String> {
    debug!("Running {} {}", script.display(), args.join(" "));
    let output = Command::new(script)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| ZkherdError::ProcessControl(format!("{}: {}", script.display(), e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ZkherdError::ProcessControl(format!(
            "{} {} exited with {}: {} {}",
            script.display(),
            args.join(" "),
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }
    Ok(stdout)
}

fn io_error(e: std::io::Error) -> ZkherdError {
    ZkherdError::ProcessControl(e.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config(install: &Path, data: &Path, spec: &str) -> InstanceConfig {
        InstanceConfig::default()
            .builder()
            .string(StringConfig::ZookeeperInstallDirectory, install.to_string_lossy())
            .string(StringConfig::ZookeeperDataDirectory, data.to_string_lossy())
            .string(StringConfig::ServersSpec, spec)
            .build()
    }

    #[test]
    fn test_render_zoo_cfg() {
        let config = config(Path::new("/opt/zk"), Path::new("/var/zk"), "1:a,2:b,O:3:c")
            .builder()
            .string(StringConfig::ZooCfgExtra, "tickTime=2000&clientPort=1&initLimit=10")
            .build();

        let rendered = render_zoo_cfg(&config, "c");
        let lines: Vec<&str> = rendered.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "tickTime=2000",
                "initLimit=10",
                "dataDir=/var/zk",
                "clientPort=2181",
                "server.1=a:2888:3888",
                "server.2=b:2888:3888",
                "server.3=c:2888:3888:observer",
                "peerType=observer",
            ]
        );

        assert!(!render_zoo_cfg(&config, "a").contains("peerType"));
    }

    #[tokio::test]
    async fn test_prepare_files() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("zk");
        let data = dir.path().join("data");
        let config = config(&install, &data, "1:a,2:b")
            .builder()
            .string(StringConfig::JavaEnvironment, "export JVMFLAGS=-Xmx1g")
            .build();

        let ops = StandardProcessOperations::new("b");
        ops.prepare_files(&config).await.unwrap();

        assert_eq!(std::fs::read_to_string(data.join("myid")).unwrap(), "2\n");
        assert!(std::fs::read_to_string(install.join("conf/zoo.cfg"))
            .unwrap()
            .contains("server.2=b:2888:3888"));
        assert_eq!(
            std::fs::read_to_string(install.join("conf/java.env")).unwrap(),
            "export JVMFLAGS=-Xmx1g"
        );

        // dropped from the list: myid goes away
        let ops = StandardProcessOperations::new("z");
        ops.prepare_files(&config).await.unwrap();
        assert!(!data.join("myid").exists());
    }

    #[tokio::test]
    async fn test_unconfigured_is_an_error() {
        let ops = StandardProcessOperations::new("a");
        let err = ops.start_instance(&InstanceConfig::default()).await.unwrap_err();
        assert!(matches!(err, ZkherdError::ProcessControl(_)));
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripts_are_invoked() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("zk");
        let data = dir.path().join("data");
        let log = dir.path().join("calls");
        write_script(
            &install.join("bin/zkServer.sh"),
            &format!("echo \"zkServer $@\" >> {}", log.display()),
        );
        write_script(
            &install.join("bin/zkCleanup.sh"),
            &format!("echo \"zkCleanup $@\" >> {}", log.display()),
        );

        let config = config(&install, &data, "1:a");
        let ops = StandardProcessOperations::new("a");
        ops.start_instance(&config).await.unwrap();
        ops.kill_instance(&config).await.unwrap();
        ops.cleanup_instance(&config).await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec![
                "zkServer start".to_string(),
                "zkServer stop".to_string(),
                format!("zkCleanup {} -n 3", data.display()),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_with_nothing_running_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("zk");
        write_script(
            &install.join("bin/zkServer.sh"),
            "echo \"no zookeeper to stop (could not find file /tmp/zookeeper_server.pid)\"; exit 1",
        );

        let config = config(&install, &dir.path().join("data"), "1:a");
        StandardProcessOperations::new("a")
            .kill_instance(&config)
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_reports_process_control() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("zk");
        write_script(&install.join("bin/zkServer.sh"), "echo broken >&2; exit 2");

        let config = config(&install, &dir.path().join("data"), "1:a");
        let err = StandardProcessOperations::new("a")
            .start_instance(&config)
            .await
            .unwrap_err();
        match err {
            ZkherdError::ProcessControl(message) => assert!(message.contains("broken")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
