use super::*;

#[test]
fn construct_complete_requery() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k1 = key(0xAA);

    let dir = match store.construct_or_async(&k1)? {
        Construct::Missing(dir) => dir,
        other => bail!("expected missing, got {other:?}"),
    };
    fs::write(dir.join("out"), b"hello")?;
    let item = store.mark_complete(&k1)?;

    assert_eq!(store.query(&k1)?, EntryStatus::Complete);
    assert_eq!(store.lookup(&k1)?, Lookup::Complete(item));
    assert!(store.is_complete(&k1)?);
    assert!(!store.is_missing(&k1)?);
    assert!(!store.is_pending(&k1)?);
    assert!(store.item_path(&item).join("out").is_file());
    Ok(())
}

#[test]
fn open_creates_the_documented_layout() -> Result<()> {
    let (_temp, store) = new_store()?;
    assert!(store.root().join("lock").is_file());
    assert!(store.root().join("metadata.db").is_file());
    Ok(())
}

#[test]
fn fresh_keys_are_missing() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x01);
    assert_eq!(store.query(&k)?, EntryStatus::Missing);
    assert_eq!(store.lookup(&k)?, Lookup::Missing);
    assert!(store.is_missing(&k)?);
    Ok(())
}

#[test]
fn pending_keys_report_pending() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x02);
    let dir = store.mark_pending(&k)?;
    assert!(dir.is_dir());
    assert_eq!(store.query(&k)?, EntryStatus::Pending);
    assert_eq!(store.lookup(&k)?, Lookup::Pending);
    Ok(())
}

#[test]
fn completed_item_hash_matches_tree() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x03);
    let item = build_with(&store, &k, "out", b"payload")?;
    let rehashed = TreeHasher.hash_directory(&store.item_path(&item))?;
    assert_eq!(&rehashed, item.hash());
    Ok(())
}

#[cfg(unix)]
#[test]
fn corrupted_links_surface_as_errors() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x5C);
    build_with(&store, &k, "out", b"x")?;

    let link = store.root().join(format!("complete-{k}"));
    crate::perms::set_root_writable(store.root())?;
    fs::remove_file(&link)?;
    std::os::unix::fs::symlink("garbage", &link)?;
    crate::perms::set_root_read_only(store.root())?;

    let err = store.lookup(&k).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::CorruptedLink { .. })
    ));
    Ok(())
}

#[test]
fn content_refs_compose_and_resolve() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x11);
    let dir = store.mark_pending(&k)?;
    fs::create_dir(dir.join("sub"))?;
    fs::write(dir.join("sub").join("data"), b"abc")?;
    let item = store.mark_complete(&k)?;

    let whole = ContentRef::whole(item);
    assert_eq!(whole.fingerprint(), *item.hash());

    let nested = whole.join("sub").join("data");
    assert_eq!(nested.fingerprint(), whole.join("sub/data").fingerprint());
    assert_ne!(nested.fingerprint(), *item.hash());
    assert_eq!(
        store.content_path(&nested),
        store.item_path(&item).join("sub/data")
    );
    assert!(store.content_path(&nested).is_file());
    Ok(())
}

#[test]
fn state_survives_reopen() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("store");
    let item = {
        let store = ContentStore::open(&root)?;
        let item = build_with(&store, &key(0x21), "out", b"keep")?;
        store.mark_pending(&key(0x22))?;
        store.close();
        item
    };

    let store = ContentStore::open(&root)?;
    assert_eq!(store.lookup(&key(0x21))?, Lookup::Complete(item));
    assert_eq!(store.query(&key(0x22))?, EntryStatus::Pending);
    Ok(())
}

#[test]
fn close_is_idempotent_and_stops_waiter_registration() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x40);
    store.mark_pending(&k)?;
    store.close();
    store.close();

    assert!(store.lookup_or_wait(&k).is_err());
    // Plain queries keep working against the filesystem.
    assert_eq!(store.query(&k)?, EntryStatus::Pending);
    Ok(())
}

#[test]
fn with_store_closes_on_success_and_error() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("store");
    let item = with_store(&root, |store| build_with(store, &key(0x31), "out", b"scoped"))?;

    let err = with_store(&root, |store| {
        assert_eq!(store.lookup(&key(0x31))?, Lookup::Complete(item));
        store.mark_complete(&key(0x32)).map(|_| ())
    })
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::NotPending { key: key(0x32) })
    );
    Ok(())
}

#[test]
fn default_root_honors_the_environment_override() -> Result<()> {
    let temp = tempdir()?;
    let override_path = temp.path().join("elsewhere");
    let previous = std::env::var_os("CASK_STORE_PATH");
    std::env::set_var("CASK_STORE_PATH", &override_path);
    let resolved = default_store_root();
    match previous {
        Some(value) => std::env::set_var("CASK_STORE_PATH", value),
        None => std::env::remove_var("CASK_STORE_PATH"),
    }
    assert_eq!(resolved?, override_path);
    Ok(())
}
