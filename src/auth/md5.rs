//! Legacy `md5` password method

/// Hash a password for an AuthenticationMD5Password challenge
///
/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));

    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(outer))
}
