/// Linux errno values returned (negated) from syscalls.
pub const ENOMEM: i64 = 12;
pub const EFAULT: i64 = 14;
pub const ENODEV: i64 = 19;
pub const EINVAL: i64 = 22;
pub const ENOSYS: i64 = 38;
