//! Challenge-response authentication (`mysql_native_password`).
//!
//! ```text
//! stage1 = SHA1(password)
//! stage2 = SHA1(stage1)
//! token  = stage1 XOR SHA1(scramble + stage2)
//! ```
//!
//! The server stores only `stage2`, so it can check a token without ever
//! seeing the password: `SHA1(token XOR SHA1(scramble + stage2)) == stage2`.

use sha1::{Digest, Sha1};

/// Length of every SHA1-based token.
pub const TOKEN_LEN: usize = 20;

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication; the only one this client implements
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
}

fn sha1(parts: &[&[u8]]) -> [u8; TOKEN_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor(a: &[u8; TOKEN_LEN], b: &[u8; TOKEN_LEN]) -> [u8; TOKEN_LEN] {
    let mut out = [0u8; TOKEN_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

/// Compute the authentication token for `password` against the server's
/// scramble (part 1 followed by part 2).
///
/// An empty password still produces a token; it is never stored.
pub fn make_token(password: &[u8], scramble: &[u8]) -> [u8; TOKEN_LEN] {
    let stage1 = sha1(&[password]);
    let stage2 = sha1(&[stage1.as_slice()]);
    let stage3 = sha1(&[scramble, stage2.as_slice()]);
    xor(&stage3, &stage1)
}

/// `SHA1(SHA1(password))`, the form a server keeps for a password.
pub fn password_hash(password: &[u8]) -> [u8; TOKEN_LEN] {
    sha1(&[sha1(&[password]).as_slice()])
}

/// Check a token the way the server does, given the stored hash.
pub fn check_token(token: &[u8], scramble: &[u8], stored_hash: &[u8; TOKEN_LEN]) -> bool {
    let Ok(token) = <&[u8; TOKEN_LEN]>::try_from(token) else {
        return false;
    };
    let stage1 = xor(token, &sha1(&[scramble, stored_hash.as_slice()]));
    sha1(&[stage1.as_slice()]) == *stored_hash
}
