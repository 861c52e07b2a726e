#[cfg(target_arch = "x86_64")]
pub static TARGET_ARCH: &str = "amd64";

#[cfg(target_arch = "aarch64")]
pub static TARGET_ARCH: &str = "arm64";

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub static TARGET_ARCH: &str = "unsupported";
