use std::io;

/// Converts a C return value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Converts a `-1`-on-failure C return value to a Rust `Result`, taking the
/// error from `errno`.
#[inline(always)]
pub(crate) fn from_c_errno(ret: i32) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_ret_conversion() {
        assert!(from_c_ret(0).is_ok());
        let err = from_c_ret(libc::ENOMEM).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert!(from_c_errno(0).is_ok());
        assert!(from_c_errno(-1).is_err());
    }
}
