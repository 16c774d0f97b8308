use super::*;

#[test]
fn waiter_resolves_when_another_handle_completes() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("store");
    let builder = ContentStore::open(&root)?;
    let observer = ContentStore::open(&root)?;
    let k = key(0x33);

    let dir = match builder.construct_or_async(&k)? {
        Construct::Missing(dir) => dir,
        other => bail!("expected missing, got {other:?}"),
    };

    let waiting = thread::spawn(move || observer.wait_until_complete(&k));

    fs::write(dir.join("out"), b"hello")?;
    thread::sleep(Duration::from_millis(100));
    let item = builder.mark_complete(&k)?;

    let observed = waiting.join().expect("observer thread panicked")?;
    assert_eq!(observed, Some(item));
    Ok(())
}

#[test]
fn abandoned_builds_deliver_failed() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x34);
    store.mark_pending(&k)?;

    let waiter = match store.lookup_or_wait(&k)? {
        LookupWait::Pending(waiter) => waiter,
        other => bail!("expected pending, got {other:?}"),
    };
    store.remove_failed(&k)?;
    assert_eq!(waiter.wait()?, Update::Failed);
    Ok(())
}

#[test]
fn construct_or_wait_surfaces_construction_failure() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("store");
    let builder = ContentStore::open(&root)?;
    let observer = ContentStore::open(&root)?;
    let k = key(0x35);
    builder.mark_pending(&k)?;

    let waiting = thread::spawn(move || observer.construct_or_wait(&k));
    thread::sleep(Duration::from_millis(500));
    builder.remove_failed(&k)?;

    let err = waiting
        .join()
        .expect("observer thread panicked")
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::FailedToConstruct { key: k })
    );
    Ok(())
}

#[test]
fn construct_or_wait_builds_and_returns_directly() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x36);

    let dir = match store.construct_or_wait(&k)? {
        BuildOutcome::Missing(dir) => dir,
        BuildOutcome::Complete(_) => bail!("nothing was built yet"),
    };
    fs::write(dir.join("out"), b"direct")?;
    let item = store.mark_complete(&k)?;

    assert_eq!(store.construct_or_wait(&k)?, BuildOutcome::Complete(item));
    Ok(())
}

#[test]
fn wait_timeout_reports_still_pending() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x37);
    store.mark_pending(&k)?;

    let LookupWait::Pending(waiter) = store.lookup_or_wait(&k)? else {
        bail!("expected pending");
    };
    assert_eq!(waiter.wait_timeout(Duration::from_millis(50))?, None);

    store.remove_failed(&k)?;
    assert_eq!(
        waiter.wait_timeout(POLL_INTERVAL + Duration::from_secs(2))?,
        Some(Update::Failed)
    );
    Ok(())
}

#[test]
fn dropping_a_waiter_cancels_its_subscription() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x38);
    let dir = store.mark_pending(&k)?;

    match store.lookup_or_wait(&k)? {
        LookupWait::Pending(waiter) => drop(waiter),
        other => bail!("expected pending, got {other:?}"),
    }

    // Completion proceeds unbothered by the dead subscription.
    fs::write(dir.join("out"), b"x")?;
    let item = store.mark_complete(&k)?;
    assert_eq!(store.lookup(&k)?, Lookup::Complete(item));
    store.close();
    Ok(())
}

#[test]
fn waiting_on_a_missing_key_returns_none() -> Result<()> {
    let (_temp, store) = new_store()?;
    assert_eq!(store.wait_until_complete(&key(0x39))?, None);
    Ok(())
}

#[test]
fn wait_until_complete_returns_finished_items_immediately() -> Result<()> {
    let (_temp, store) = new_store()?;
    let k = key(0x3A);
    let item = build_with(&store, &k, "out", b"already there")?;
    assert_eq!(store.wait_until_complete(&k)?, Some(item));
    Ok(())
}
