// ============================================
// Reimager - drivers.rs
// ============================================
// Carry the running system's drivers into the new install image:
//
// 1. export the installed drivers to <work>/drivers
// 2. recreate <work>/mount
// 3. mount install.wim at the install index
// 4. add the exported drivers (recursive)
// 5. commit and unmount
//
// Any failure ends the stage. Once step 3 succeeded the image is always
// unmounted again: committed on success, discarded on failure.
// ============================================

use std::path::Path;

use walkdir::WalkDir;

use crate::dism::{ImageService, WimMountGuard};
use crate::error::Result;
use crate::image::CanonicalImage;
use crate::pipeline::RunDirectories;
use crate::selection::Selection;

pub struct DriverStage<'a> {
    images: &'a dyn ImageService,
    dirs: &'a RunDirectories,
}

impl<'a> DriverStage<'a> {
    pub fn new(images: &'a dyn ImageService, dirs: &'a RunDirectories) -> Self {
        DriverStage { images, dirs }
    }

    pub fn run(&self, selection: &Selection, image: &CanonicalImage) -> Result<()> {
        if !selection.backup_drivers {
            tracing::info!("Driver backup not requested, skipping");
            return Ok(());
        }

        tracing::info!("Exporting installed drivers to {}...", self.dirs.drivers.display());
        self.images.export_drivers(&self.dirs.drivers)?;

        let packages = count_driver_packages(&self.dirs.drivers);
        if packages == 0 {
            tracing::warn!("No third-party drivers were exported, nothing to inject");
            return Ok(());
        }
        tracing::info!("Exported {} driver package(s)", packages);

        self.dirs.recreate_mount()?;

        let guard =
            WimMountGuard::mount(self.images, &image.path, image.index, &self.dirs.mount)?;
        tracing::info!("Injecting drivers...");
        self.images.add_drivers(guard.mount_dir(), &self.dirs.drivers)?;
        guard.commit_and_disarm()
    }
}

/// Number of .inf files under `dir`. Each exported package carries one.
pub fn count_driver_packages(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("inf"))
                .unwrap_or(false)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReimageError;
    use crate::fakes::{FakeImageService, Journal};
    use crate::selection::Mode;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RunDirectories, CanonicalImage) {
        let tmp = TempDir::new().unwrap();
        let dirs = RunDirectories::new(tmp.path());
        dirs.create().unwrap();
        fs::write(dirs.canonical_image(), "wim").unwrap();
        let image = CanonicalImage {
            path: dirs.canonical_image(),
            index: 4,
        };
        (tmp, dirs, image)
    }

    fn selection(backup: bool) -> Selection {
        Selection::new(Mode::Win10, None, None, backup).unwrap()
    }

    #[test]
    fn test_skipped_when_not_requested() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let service = FakeImageService::new(&journal);
        DriverStage::new(&service, &dirs)
            .run(&selection(false), &image)
            .unwrap();
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_full_sequence() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let service = FakeImageService::new(&journal);
        DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .unwrap();
        assert_eq!(
            journal.entries(),
            vec!["export-drivers", "mount 4", "add-drivers", "unmount commit"]
        );
        assert!(dirs.mount.is_dir());
    }

    #[test]
    fn test_mount_failure_skips_inject_and_unmount() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let mut service = FakeImageService::new(&journal);
        service.fail_mount = true;
        let err = DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .unwrap_err();
        assert!(matches!(err, ReimageError::ExternalTool { .. }));
        assert_eq!(journal.entries(), vec!["export-drivers", "mount 4"]);
    }

    #[test]
    fn test_inject_failure_still_releases_mount() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let mut service = FakeImageService::new(&journal);
        service.fail_add_drivers = true;
        assert!(DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .is_err());
        assert_eq!(
            journal.entries(),
            vec!["export-drivers", "mount 4", "add-drivers", "unmount discard"]
        );
    }

    #[test]
    fn test_export_failure_is_fatal() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let mut service = FakeImageService::new(&journal);
        service.fail_export_drivers = true;
        assert!(DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .is_err());
        assert_eq!(journal.entries(), vec!["export-drivers"]);
    }

    #[test]
    fn test_no_exported_drivers_skips_mount() {
        let (_tmp, dirs, image) = setup();
        let journal = Journal::default();
        let mut service = FakeImageService::new(&journal);
        service.no_drivers = true;
        DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .unwrap();
        assert_eq!(journal.entries(), vec!["export-drivers"]);
    }

    #[test]
    fn test_stale_mount_contents_are_purged() {
        let (_tmp, dirs, image) = setup();
        fs::create_dir_all(dirs.mount.join("leftover")).unwrap();
        let journal = Journal::default();
        let service = FakeImageService::new(&journal);
        DriverStage::new(&service, &dirs)
            .run(&selection(true), &image)
            .unwrap();
        assert!(!dirs.mount.join("leftover").exists());
    }

    #[test]
    fn test_count_driver_packages() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b").join("nested")).unwrap();
        fs::write(root.join("a").join("net.inf"), "").unwrap();
        fs::write(root.join("a").join("net.sys"), "").unwrap();
        fs::write(root.join("b").join("nested").join("GPU.INF"), "").unwrap();
        assert_eq!(count_driver_packages(root), 2);
        assert_eq!(count_driver_packages(&root.join("missing")), 0);
    }
}
