/// Creates the tree below in a fresh temporary directory:
///
/// ```text
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
///    |- 3.txt
/// |- baz
///    |- 4.txt
/// ```
pub fn setup_test_tree() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    let root = tmp_dir.path();
    std::fs::write(root.join("0.txt"), "0")?;
    let bar_path = root.join("bar");
    std::fs::create_dir(&bar_path)?;
    std::fs::write(bar_path.join("1.txt"), "1")?;
    std::fs::write(bar_path.join("2.txt"), "2")?;
    std::fs::write(bar_path.join("3.txt"), "3")?;
    let baz_path = root.join("baz");
    std::fs::create_dir(&baz_path)?;
    std::fs::write(baz_path.join("4.txt"), "4")?;
    Ok(tmp_dir)
}
