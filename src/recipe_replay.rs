//! Reconstruct an equivalent `docker run` invocation from a captured
//! `*_inspect.json` recipe (§4.8), for standalone (non-compose) containers
//! that have no compose file to redeploy from. Grounded in
//! `DockerRunBuilder`.

use std::path::Path;

use serde_json::Value as JsonValue;

use crate::constants::{DEFAULT_CPU_SHARES, DEFAULT_ENTRYPOINT, DOCKER_INJECTED_ENV_PREFIXES};

/// One reconstructed container recreation recipe.
#[derive(Debug, Clone)]
pub struct ReplayCommand {
    pub container_name: String,
    pub image: String,
    pub networks: Vec<String>,
    /// Full `docker run ...` argv, ready to hand to a process runner or
    /// print for an operator to review.
    pub args: Vec<String>,
}

/// Find and parse every `*_inspect.json` file under `restore_path`, sorted
/// by filename, building a replay command for each that parses cleanly.
/// A file that fails to parse is skipped rather than aborting the whole
/// batch, since one bad recipe shouldn't block recovery of the others.
pub fn build_all_commands(restore_path: &Path) -> Vec<ReplayCommand> {
    let Ok(entries) = std::fs::read_dir(restore_path) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with("_inspect.json")))
        .collect();
    files.sort();

    files
        .into_iter()
        .filter_map(|path| {
            let raw = std::fs::read_to_string(&path).ok()?;
            let data: JsonValue = serde_json::from_str(&raw).ok()?;
            Some(build_command(&data))
        })
        .collect()
}

/// Build a single replay command from one container's inspect JSON.
pub fn build_command(data: &JsonValue) -> ReplayCommand {
    let config = data.get("Config").cloned().unwrap_or(JsonValue::Null);
    let host_config = data.get("HostConfig").cloned().unwrap_or(JsonValue::Null);
    let network_settings = data.get("NetworkSettings").cloned().unwrap_or(JsonValue::Null);
    let mounts = data.get("Mounts").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let container_name = container_name(data);
    let image = config.get("Image").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();

    let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

    if container_name != "unknown" {
        args.push("--name".to_string());
        args.push(container_name.clone());
    }

    if let Some(restart) = host_config.pointer("/RestartPolicy/Name").and_then(|v| v.as_str()) {
        if restart != "no" && !restart.is_empty() {
            args.push("--restart".to_string());
            args.push(restart.to_string());
        }
    }

    if let Some(network) = host_config.get("NetworkMode").and_then(|v| v.as_str()) {
        if !network.is_empty() && network != "default" && network != "bridge" {
            args.push("--network".to_string());
            args.push(network.to_string());
        }
    }

    if let Some(hostname) = config.get("Hostname").and_then(|v| v.as_str()) {
        if !hostname.is_empty() {
            args.push("--hostname".to_string());
            args.push(hostname.to_string());
        }
    }

    if let Some(bindings) = host_config.get("PortBindings").and_then(|v| v.as_object()) {
        for (container_port, entries) in bindings {
            let Some(entries) = entries.as_array() else { continue };
            let container_port_num = container_port.split('/').next().unwrap_or(container_port);
            for binding in entries {
                let host_port = binding.get("HostPort").and_then(|v| v.as_str()).unwrap_or("");
                let host_ip = binding.get("HostIp").and_then(|v| v.as_str()).unwrap_or("");
                let spec = if !host_ip.is_empty() {
                    format!("{host_ip}:{host_port}:{container_port_num}")
                } else if !host_port.is_empty() {
                    format!("{host_port}:{container_port_num}")
                } else {
                    container_port_num.to_string()
                };
                args.push("-p".to_string());
                args.push(spec);
            }
        }
    }

    for mount in &mounts {
        let mount_type = mount.get("Type").and_then(|v| v.as_str()).unwrap_or("bind");
        let dest = mount.get("Destination").and_then(|v| v.as_str()).unwrap_or("");
        match mount_type {
            "bind" => {
                let src = mount.get("Source").and_then(|v| v.as_str()).unwrap_or("");
                let rw = mount.get("RW").and_then(|v| v.as_bool()).unwrap_or(true);
                let mode = if rw { "" } else { ":ro" };
                args.push("-v".to_string());
                args.push(format!("{src}:{dest}{mode}"));
            }
            "volume" => {
                if let Some(name) = mount.get("Name").and_then(|v| v.as_str()) {
                    if !name.is_empty() {
                        args.push("-v".to_string());
                        args.push(format!("{name}:{dest}"));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(envs) = config.get("Env").and_then(|v| v.as_array()) {
        for env in envs {
            if let Some(env) = env.as_str() {
                if !is_docker_injected_env(env) {
                    args.push("-e".to_string());
                    args.push(env.to_string());
                }
            }
        }
    }

    if let Some(user) = config.get("User").and_then(|v| v.as_str()) {
        if !user.is_empty() {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
    }

    if let Some(workdir) = config.get("WorkingDir").and_then(|v| v.as_str()) {
        if !workdir.is_empty() && workdir != "/" {
            args.push("-w".to_string());
            args.push(workdir.to_string());
        }
    }

    if host_config.get("Privileged").and_then(|v| v.as_bool()).unwrap_or(false) {
        args.push("--privileged".to_string());
    }

    for cap in host_config.get("CapAdd").and_then(|v| v.as_array()).into_iter().flatten() {
        if let Some(cap) = cap.as_str() {
            args.push("--cap-add".to_string());
            args.push(cap.to_string());
        }
    }
    for cap in host_config.get("CapDrop").and_then(|v| v.as_array()).into_iter().flatten() {
        if let Some(cap) = cap.as_str() {
            args.push("--cap-drop".to_string());
            args.push(cap.to_string());
        }
    }

    if let Some(memory) = host_config.get("Memory").and_then(|v| v.as_i64()) {
        if memory > 0 {
            args.push("-m".to_string());
            args.push(memory.to_string());
        }
    }

    if let Some(cpu_shares) = host_config.get("CpuShares").and_then(|v| v.as_i64()) {
        if cpu_shares != 0 && cpu_shares != DEFAULT_CPU_SHARES {
            args.push("--cpu-shares".to_string());
            args.push(cpu_shares.to_string());
        }
    }

    if let Some(labels) = config.get("Labels").and_then(|v| v.as_object()) {
        for (key, value) in labels {
            if !key.starts_with("com.docker.compose") {
                let value = value.as_str().unwrap_or_default();
                args.push("-l".to_string());
                args.push(format!("{key}={value}"));
            }
        }
    }

    if let Some(entrypoint) = config.get("Entrypoint").and_then(|v| v.as_array()) {
        let strs: Vec<&str> = entrypoint.iter().filter_map(|v| v.as_str()).collect();
        if !strs.is_empty() && strs != DEFAULT_ENTRYPOINT {
            args.push("--entrypoint".to_string());
            args.push(strs.join(" "));
        }
    }

    args.push(image.clone());

    if let Some(cmd) = config.get("Cmd").and_then(|v| v.as_array()) {
        let strs: Vec<&str> = cmd.iter().filter_map(|v| v.as_str()).collect();
        let joined = strs.join(" ");
        if !joined.trim().is_empty() {
            args.push(joined);
        }
    }

    let networks = network_settings
        .get("Networks")
        .and_then(|v| v.as_object())
        .map(|m| m.keys().filter(|n| !matches!(n.as_str(), "bridge" | "host" | "none")).cloned().collect())
        .unwrap_or_default();

    ReplayCommand { container_name, image, networks, args }
}

fn container_name(data: &JsonValue) -> String {
    data.get("Name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim_start_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_docker_injected_env(env: &str) -> bool {
    DOCKER_INJECTED_ENV_PREFIXES.iter().any(|prefix| env.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reconstructs_basic_run_command() {
        let data = json!({
            "Name": "/nginx",
            "Config": {
                "Image": "nginx:latest",
                "Env": ["PATH=/usr/bin", "MYSQL_ROOT_PASSWORD=secret"],
                "Labels": {"com.docker.compose.project": "web", "custom": "yes"}
            },
            "HostConfig": {
                "RestartPolicy": {"Name": "unless-stopped"},
                "PortBindings": {"80/tcp": [{"HostPort": "8080", "HostIp": ""}]},
                "CpuShares": 1024
            },
            "Mounts": [
                {"Type": "volume", "Name": "nginx_data", "Destination": "/usr/share/nginx/html", "RW": true}
            ],
            "NetworkSettings": {"Networks": {"bridge": {}, "web_net": {}}}
        });

        let cmd = build_command(&data);
        assert_eq!(cmd.container_name, "nginx");
        assert_eq!(cmd.image, "nginx:latest");
        assert!(cmd.args.contains(&"--name".to_string()));
        assert!(cmd.args.contains(&"8080:80".to_string()));
        assert!(cmd.args.contains(&"nginx_data:/usr/share/nginx/html".to_string()));
        assert!(cmd.args.iter().any(|a| a == "MYSQL_ROOT_PASSWORD=secret"));
        assert!(!cmd.args.iter().any(|a| a.starts_with("PATH=")));
        assert!(cmd.args.iter().any(|a| a == "custom=yes"));
        assert!(!cmd.args.iter().any(|a| a == "com.docker.compose.project=web"));
        assert_eq!(cmd.networks, vec!["web_net".to_string()]);
        assert!(!cmd.args.contains(&"--cpu-shares".to_string()));
    }

    #[test]
    fn omits_default_entrypoint_and_keeps_custom() {
        let data = json!({
            "Name": "/app",
            "Config": {"Image": "app:1", "Entrypoint": ["/docker-entrypoint.sh"]},
            "HostConfig": {},
        });
        let cmd = build_command(&data);
        assert!(!cmd.args.contains(&"--entrypoint".to_string()));

        let data2 = json!({
            "Name": "/app",
            "Config": {"Image": "app:1", "Entrypoint": ["/custom-entry.sh", "--flag"]},
            "HostConfig": {},
        });
        let cmd2 = build_command(&data2);
        assert!(cmd2.args.contains(&"--entrypoint".to_string()));
    }
}
