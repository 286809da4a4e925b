//! Flavor-specific system package and user management syntax.

use super::shell_quote;
use crate::core::types::Flavor;

/// apt needs exclusive access to its caches, hence `sharing=locked`.
pub const APT_CACHE_MOUNTS: &str = "--mount=type=cache,target=/var/cache/apt,sharing=locked --mount=type=cache,target=/var/lib/apt,sharing=locked";
pub const APK_CACHE_MOUNT: &str = "--mount=type=cache,target=/var/cache/apk,sharing=locked";
/// Debian images purge `/var/cache/apt` after every install unless this
/// hook is removed.
const APT_DOCKER_CLEAN: &str = "/etc/apt/apt.conf.d/docker-clean";

/// Tools the builder cleanup needs to find and strip shared objects.
pub const STRIP_TOOLS: [&str; 2] = ["file", "binutils"];

/// Numeric uid and gid of the unprivileged runtime user.
pub const NONROOT_ID: u32 = 65532;
pub const NONROOT_NAME: &str = "nonroot";
pub const NONROOT_HOME: &str = "/home/nonroot";

/// `RUN` arguments installing build-only packages under a cache mount.
/// `None` when there is nothing to install.
pub fn build_install(flavor: Flavor, packages: &[String]) -> Option<String> {
    if packages.is_empty() {
        return None;
    }
    Some(cached_install(flavor, &quoted_list(packages)))
}

/// `RUN` arguments installing [`STRIP_TOOLS`] under a cache mount.
pub fn strip_tools_install(flavor: Flavor) -> String {
    let tools: Vec<String> = STRIP_TOOLS.iter().map(|t| t.to_string()).collect();
    cached_install(flavor, &quoted_list(&tools))
}

fn cached_install(flavor: Flavor, list: &str) -> String {
    match flavor {
        Flavor::Debian => format!(
            "{} rm -f {} && apt-get update && apt-get install -y --no-install-recommends {}",
            APT_CACHE_MOUNTS, APT_DOCKER_CLEAN, list
        ),
        Flavor::Alpine => format!("{} apk add --update-cache {}", APK_CACHE_MOUNT, list),
    }
}

/// `RUN` arguments installing runtime packages, followed by cache cleanup
/// so the index never lands in the final image.
pub fn runtime_install(flavor: Flavor, packages: &[String]) -> Option<String> {
    if packages.is_empty() {
        return None;
    }
    let list = quoted_list(packages);
    Some(match flavor {
        Flavor::Debian => format!(
            "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
            list
        ),
        Flavor::Alpine => format!("apk add --update-cache {} && rm -rf /var/cache/apk/*", list),
    })
}

/// `RUN` arguments creating the unprivileged user and its group.
pub fn create_user(flavor: Flavor) -> String {
    match flavor {
        Flavor::Debian => format!(
            "useradd --uid={id} --user-group --home-dir={home} --create-home {name}",
            id = NONROOT_ID,
            home = NONROOT_HOME,
            name = NONROOT_NAME
        ),
        Flavor::Alpine => format!(
            "addgroup -g {id} {name} && adduser -D -u {id} -G {name} -h {home} {name}",
            id = NONROOT_ID,
            home = NONROOT_HOME,
            name = NONROOT_NAME
        ),
    }
}

fn quoted_list(packages: &[String]) -> String {
    packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}
