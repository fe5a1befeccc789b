//! Class-folder discovery for `<root>/{train,val}/<class>/*.<ext>` trees.

use std::fs;
use std::path::{Path, PathBuf};

use leaf_core::{ClassSet, Error, ImageSample, Result};
use tracing::debug;

/// Image file extensions accepted by the scanner (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// Sorted subdirectory paths of `dir`.
fn class_directories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Builds the class set from the subdirectory names of the training partition.
pub fn discover_classes(train_dir: &Path) -> Result<ClassSet> {
    if !train_dir.is_dir() {
        return Err(Error::NotFound(train_dir.to_path_buf()));
    }

    let names = class_directories(train_dir)?.iter().map(|p| dir_name(p)).collect::<Vec<_>>();
    ClassSet::from_directory_names(names)
}

/// Scans a directory for image files, sorted by path
pub fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Lists every sample of a partition, labelled through `classes`.
///
/// A class directory whose name is not in `classes` is a configuration error:
/// its label would not match anything the model was built for.
pub fn scan_split(split_dir: &Path, classes: &ClassSet) -> Result<Vec<ImageSample>> {
    let mut samples = Vec::new();

    for class_dir in class_directories(split_dir)? {
        let name = dir_name(&class_dir);
        let label = classes.label_of(&name).ok_or_else(|| {
            Error::Config(format!(
                "class directory {} is not a training class",
                class_dir.display()
            ))
        })?;

        let images = scan_directory(&class_dir)?;
        debug!("{}: {} images", class_dir.display(), images.len());
        samples.extend(images.into_iter().map(|path| ImageSample::new(path, label)));
    }

    Ok(samples)
}

/// The scanned dataset tree
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub classes: ClassSet,
    pub train: Vec<ImageSample>,
    /// `None` when the tree has no `val/` partition
    pub val: Option<Vec<ImageSample>>,
}

impl ImageFolder {
    pub fn open(root: &Path) -> Result<Self> {
        let train_dir = root.join("train");
        let val_dir = root.join("val");

        let classes = discover_classes(&train_dir)?;
        let train = scan_split(&train_dir, &classes)?;
        let val = if val_dir.is_dir() {
            Some(scan_split(&val_dir, &classes)?)
        } else {
            None
        };

        Ok(Self {
            classes,
            train,
            val,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_image(path: &Path) {
        let img = image::ImageBuffer::from_fn(8, 8, |_, _| image::Rgb([255u8, 0u8, 0u8]));
        img.save(path).unwrap();
    }

    fn populate(dir: &Path, classes: &[&str], per_class: usize) {
        for class in classes {
            let class_dir = dir.join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..per_class {
                create_test_image(&class_dir.join(format!("img_{i}.png")));
            }
        }
    }

    #[test]
    fn test_discover_classes_sorted() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("train"), &["pest_damage", "healthy", "disease"], 1);

        let classes = discover_classes(&temp.path().join("train")).unwrap();
        assert_eq!(classes.names(), &["disease", "healthy", "pest_damage"]);

        let again = discover_classes(&temp.path().join("train")).unwrap();
        assert_eq!(classes, again);
    }

    #[test]
    fn test_missing_train_dir_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = ImageFolder::open(temp.path()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_single_class_is_config_error() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("train"), &["healthy"], 2);
        let err = ImageFolder::open(temp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_scan_filters_extensions_case_insensitively() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        create_test_image(&dir.join("a.png"));
        fs::copy(dir.join("a.png"), dir.join("b.PNG")).unwrap();
        fs::write(dir.join("notes.txt"), "not an image").unwrap();

        let images = scan_directory(dir).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0] < images[1]);
    }

    #[test]
    fn test_open_with_and_without_val() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("train"), &["a", "b"], 3);

        let folder = ImageFolder::open(temp.path()).unwrap();
        assert_eq!(folder.train.len(), 6);
        assert!(folder.val.is_none());
        assert_eq!(folder.train[0].label, 0);
        assert_eq!(folder.train[5].label, 1);

        populate(&temp.path().join("val"), &["b"], 2);
        let folder = ImageFolder::open(temp.path()).unwrap();
        let val = folder.val.unwrap();
        assert_eq!(val.len(), 2);
        assert!(val.iter().all(|s| s.label == 1));
    }

    #[test]
    fn test_unknown_val_class_is_config_error() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("train"), &["a", "b"], 1);
        populate(&temp.path().join("val"), &["c"], 1);

        let err = ImageFolder::open(temp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
