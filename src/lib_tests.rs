use super::*;

#[test]
fn errno_mapping_covers_the_taxonomy() {
    assert_eq!(
        ZbdError::InvalidArgument("buffer".to_string()).errno(),
        -libc::EFAULT
    );
    assert_eq!(
        ZbdError::NoDevice {
            path: "/dev/null".to_string(),
            reason: "rejected".to_string(),
        }
        .errno(),
        -libc::ENODEV
    );
    assert_eq!(ZbdError::NoMemory(1024).errno(), -libc::ENOMEM);
    assert_eq!(
        ZbdError::NotSupported {
            backend: "ata",
            operation: "SET ZONES",
        }
        .errno(),
        -libc::ENXIO
    );
    assert_eq!(
        ZbdError::InvalidZone("bad LBA".to_string()).errno(),
        -libc::EINVAL
    );
}

#[test]
fn io_errno_prefers_the_os_code() {
    let os = ZbdError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
    assert_eq!(os.errno(), -libc::ENOSPC);

    let synthetic = ZbdError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "sense key 0xb",
    ));
    assert_eq!(synthetic.errno(), -libc::EIO);
}

// One test for all the log level behavior: the level is process-wide
// state and parallel tests poking it would race each other.
#[test]
fn log_level_names_map_to_filters() {
    for (name, filter) in [
        ("error", log::LevelFilter::Error),
        ("info", log::LevelFilter::Info),
        ("debug", log::LevelFilter::Debug),
        ("vdebug", log::LevelFilter::Trace),
    ] {
        set_log_level(name);
        assert_eq!(log::max_level(), filter);
    }

    // Unrecognized names are rejected and leave the level untouched.
    set_log_level("shouting");
    assert_eq!(log::max_level(), log::LevelFilter::Trace);

    set_log_level("none");
    assert_eq!(log::max_level(), log::LevelFilter::Off);
}
