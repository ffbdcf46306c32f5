//! Location of the packaged library binary per platform.

use std::sync::OnceLock;

/// Platform a packaged artifact is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactPlatform {
    /// macOS, universal binary.
    MacOs,
    /// iOS simulator.
    IosSimulator,
    /// iOS device.
    IosDevice,
    /// Linux.
    Linux,
    /// Windows.
    Windows,
    /// Android.
    Android,
}

const ARTIFACTS: &[(ArtifactPlatform, &str)] = &[
    (
        ArtifactPlatform::MacOs,
        "CloudSync.xcframework/macos-arm64_x86_64/CloudSync.framework/CloudSync",
    ),
    (
        ArtifactPlatform::IosSimulator,
        "CloudSync.xcframework/ios-arm64_x86_64-simulator/CloudSync.framework/CloudSync",
    ),
    (
        ArtifactPlatform::IosDevice,
        "CloudSync.xcframework/ios-arm64/CloudSync.framework/CloudSync",
    ),
    (ArtifactPlatform::Linux, "lib/libcloudsync_ext.so"),
    (ArtifactPlatform::Windows, "bin/cloudsync_ext.dll"),
    (ArtifactPlatform::Android, "jniLibs/libcloudsync_ext.so"),
];

impl ArtifactPlatform {
    /// Resolves a target triple such as `aarch64-apple-ios-sim`.
    ///
    /// `x86_64` iOS targets are simulators; other iOS targets are devices
    /// unless they carry the `sim` suffix.
    pub fn from_target(triple: &str) -> Option<Self> {
        let parts: Vec<&str> = triple.split('-').collect();
        let arch = parts.first().copied().unwrap_or_default();
        let has = |part: &str| parts.contains(&part);

        if has("android") || has("androideabi") {
            Some(Self::Android)
        } else if has("ios") {
            if has("sim") || arch == "x86_64" {
                Some(Self::IosSimulator)
            } else {
                Some(Self::IosDevice)
            }
        } else if has("darwin") || has("macos") {
            Some(Self::MacOs)
        } else if has("windows") {
            Some(Self::Windows)
        } else if has("linux") {
            Some(Self::Linux)
        } else {
            None
        }
    }

    /// Platform this library was compiled for, resolved once.
    pub fn current() -> Option<Self> {
        static CURRENT: OnceLock<Option<ArtifactPlatform>> = OnceLock::new();
        *CURRENT.get_or_init(|| Self::from_target(env!("CLOUDSYNC_TARGET")))
    }

    /// Binary path relative to the package root.
    pub fn binary_path(self) -> &'static str {
        ARTIFACTS
            .iter()
            .find(|(platform, _)| *platform == self)
            .map_or("", |(_, path)| path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_target_triples() {
        let cases = [
            ("aarch64-apple-darwin", ArtifactPlatform::MacOs),
            ("x86_64-apple-darwin", ArtifactPlatform::MacOs),
            ("aarch64-apple-ios", ArtifactPlatform::IosDevice),
            ("aarch64-apple-ios-sim", ArtifactPlatform::IosSimulator),
            ("x86_64-apple-ios", ArtifactPlatform::IosSimulator),
            ("x86_64-unknown-linux-gnu", ArtifactPlatform::Linux),
            ("x86_64-pc-windows-msvc", ArtifactPlatform::Windows),
            ("aarch64-linux-android", ArtifactPlatform::Android),
            ("armv7-linux-androideabi", ArtifactPlatform::Android),
        ];
        for (triple, platform) in cases {
            assert_eq!(ArtifactPlatform::from_target(triple), Some(platform), "{triple}");
        }
        assert_eq!(ArtifactPlatform::from_target("wasm32-unknown-unknown"), None);
    }

    #[test]
    fn every_platform_has_a_path() {
        for (platform, _) in ARTIFACTS {
            assert!(!platform.binary_path().is_empty());
        }
        assert!(ArtifactPlatform::IosSimulator
            .binary_path()
            .contains("simulator"));
    }

    #[test]
    fn current_is_stable() {
        assert_eq!(ArtifactPlatform::current(), ArtifactPlatform::current());
        #[cfg(target_os = "linux")]
        assert_eq!(ArtifactPlatform::current(), Some(ArtifactPlatform::Linux));
    }
}
