//! Remote and local command lines used by the runner

use std::borrow::Cow;

use crate::types::{KillList, MountSpecification};

/// Shell command that kills every process in `kill_list` on the device and
/// unmounts every mount point.
///
/// Each name first gets `pkill -x`, then after a single `sleep 1` a
/// `pkill -x -9`. Unmounting needs the elevated prefix `sudo`.
pub fn cleanup_command(kill_list: &KillList, mounts: &[MountSpecification], sudo: &str) -> String {
    let mut nice_kill = String::new();
    let mut brutal_kill = String::new();
    for proc in kill_list.iter() {
        let proc = shell_quote(proc);
        nice_kill.push_str(&format!("pkill -x {};", proc));
        brutal_kill.push_str(&format!("pkill -x -9 {};", proc));
    }

    let mut remote_call = nice_kill + "sleep 1; " + &brutal_kill;
    for mount in mounts {
        remote_call.push_str(&format!(
            "{} umount {};",
            sudo,
            shell_quote(&mount.remote_mount_point)
        ));
    }

    let trimmed = remote_call.trim_end();
    trimmed.strip_suffix(';').unwrap_or(trimmed).to_string()
}

/// Shell command that creates every mount point and attaches the helper
/// client to it.
///
/// Steps are chained with `&&` so nothing runs after a failure. The leading
/// `:` keeps the command valid when there are no mounts.
pub fn mount_command(
    mounts: &[MountSpecification],
    client_on_device: &str,
    host_address: &str,
    sudo: &str,
) -> String {
    let client_on_device = shell_quote(client_on_device);
    let mut remote_call = String::from(":");
    for mount in mounts {
        let mount_point = shell_quote(&mount.remote_mount_point);
        let mkdir = format!("{} mkdir -p {}", sudo, mount_point);
        let client = format!(
            "{client} -l {port} -r {port} -c {host}:{port} {mount_point}",
            client = client_on_device,
            port = mount.port,
            host = shell_quote(host_address),
            mount_point = mount_point,
        );
        remote_call.push_str(" && ");
        remote_call.push_str(&mkdir);
        remote_call.push_str(" && ");
        remote_call.push_str(&client);
    }
    remote_call
}

/// `value` as one shell word. Words made only of characters the shell
/// treats literally come back unchanged; anything else is single-quoted.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let literal = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c));
    if literal {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// Arguments for a local helper server bridging `port`: the port doubles as
/// local secret, remote secret and bind port.
pub fn helper_server_args(port: u16) -> Vec<String> {
    let port = port.to_string();
    vec![
        "-l".to_string(),
        port.clone(),
        "-r".to_string(),
        port.clone(),
        "-b".to_string(),
        port,
    ]
}
