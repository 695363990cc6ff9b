//! Pre-built mock filesystem scenarios for testing.

use super::filesystem::MockFs;

impl MockFs {
    /// A small single-process layout: stdio plus one log file open, a
    /// main thread and one helper thread.
    pub fn typical_self() -> Self {
        let mut fs = Self::new();
        fs.add_self_process(
            "\
Name:\tleakprobe
Umask:\t0022
State:\tR (running)
Tgid:\t4242
Pid:\t4242
PPid:\t1
VmPeak:\t   20000 kB
VmSize:\t   18000 kB
VmHWM:\t    8200 kB
VmRSS:\t    8000 kB
RssAnon:\t    6000 kB
RssFile:\t    2000 kB
VmData:\t    9000 kB
VmStk:\t     132 kB
Threads:\t2
",
            "\
55d0c0a00000-7ffd5a5f2000 ---p 00000000 00:00 0                          [rollup]
Rss:                8000 kB
Pss:                7000 kB
Shared_Clean:       1500 kB
Shared_Dirty:        100 kB
Private_Clean:       400 kB
Private_Dirty:      6000 kB
Referenced:         8000 kB
Anonymous:          6000 kB
Swap:                  0 kB
Private_Hugetlb:       0 kB
",
            &[0, 1, 2, 3],
            &[4242, 4243],
        );
        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::traits::FileSystem;
    use std::path::Path;

    #[test]
    fn test_typical_self_layout() {
        let fs = MockFs::typical_self();
        assert!(fs.exists(Path::new("/proc/self/status")));
        assert!(fs.exists(Path::new("/proc/self/smaps_rollup")));
        assert_eq!(fs.read_dir(Path::new("/proc/self/fd")).unwrap().len(), 4);
        assert_eq!(fs.read_dir(Path::new("/proc/self/task")).unwrap().len(), 2);
    }
}
