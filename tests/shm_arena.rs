// tests/shm_arena.rs
// Run with: cargo test --test shm_arena -- --nocapture

use dmxp_shmsg::Core::alloc::{HEADER_SIZE, CHUNK_ALIGN};
use dmxp_shmsg::Core::{ArenaManager, ShmArena, ShutdownSignal};
use dmxp_shmsg::SHM::Structs::Envelope;
use dmxp_shmsg::SHM::{ContextBuilder, Message, TransportContext};
use dmxp_shmsg::{Result, ShmError};
use serial_test::serial;
use std::fs;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SEGMENT: &str = "dmxp_test_arena";

#[test]
#[serial]
fn test_create_and_attach() -> Result<()> {
    cleanup_shared_memory();

    let arena = ShmArena::create(SEGMENT, 64 * 1024)?;
    assert!(arena.is_initialized());
    assert!(arena.is_owner());
    assert_eq!(arena.capacity(), 64 * 1024);
    assert_eq!(arena.used_bytes(), 0);
    assert_eq!(arena.allocation_count(), 0);

    let peer = ShmArena::attach(SEGMENT)?;
    assert!(!peer.is_owner());
    assert_eq!(peer.capacity(), arena.capacity());

    // debugging
    println!("Arena Struct: {:#?}", arena);
    Ok(())
}

#[test]
#[serial]
fn test_too_small_rejected() {
    cleanup_shared_memory();
    assert!(matches!(
        ShmArena::create(SEGMENT, HEADER_SIZE),
        Err(ShmError::Segment(_))
    ));
}

#[test]
#[serial]
fn test_attach_missing_segment() {
    cleanup_shared_memory();
    assert!(matches!(ShmArena::attach(SEGMENT), Err(ShmError::Io(_))));
}

#[test]
#[serial]
fn test_handles_translate_across_mappings() -> Result<()> {
    cleanup_shared_memory();

    let arena = ShmArena::create(SEGMENT, 64 * 1024)?;
    let peer = ShmArena::attach(SEGMENT)?;

    let ptr = arena.allocate(100)?;
    let handle = arena.handle_from_address(ptr)?;
    assert!(handle > 0);
    assert_eq!(ptr.as_ptr() as usize % CHUNK_ALIGN, 0);

    unsafe { std::ptr::copy_nonoverlapping(b"cross-process".as_ptr(), ptr.as_ptr(), 13) };

    let peer_ptr = peer.address_from_handle(handle)?;
    let seen = unsafe { std::slice::from_raw_parts(peer_ptr.as_ptr(), 13) };
    assert_eq!(seen, b"cross-process");

    // The peer can free what the creator allocated
    peer.deallocate(peer_ptr)?;
    assert_eq!(arena.allocation_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_invalid_handles_rejected() -> Result<()> {
    cleanup_shared_memory();
    let arena = ShmArena::create(SEGMENT, 16 * 1024)?;

    for handle in [0isize, -16, 1, HEADER_SIZE as isize, 16 * 1024, isize::MAX] {
        assert!(
            matches!(arena.address_from_handle(handle), Err(ShmError::InvalidHandle(_))),
            "handle {handle} should be rejected"
        );
    }
    Ok(())
}

#[test]
#[serial]
fn test_exhaustion_and_reuse() -> Result<()> {
    cleanup_shared_memory();
    let arena = ShmArena::create(SEGMENT, 16 * 1024)?;

    let mut chunks = vec![];
    loop {
        match arena.allocate(1000) {
            Ok(ptr) => chunks.push(ptr),
            Err(ShmError::Exhausted { requested }) => {
                assert_eq!(requested, 1000);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    assert!(!chunks.is_empty());
    assert_eq!(arena.allocation_count(), chunks.len() as u64);

    // Larger than the whole arena can never fit
    assert!(matches!(
        arena.allocate(1 << 20),
        Err(ShmError::TooLarge { requested, .. }) if requested == 1 << 20
    ));

    for ptr in chunks.drain(..) {
        arena.deallocate(ptr)?;
    }
    assert_eq!(arena.used_bytes(), 0);

    // Coalescing gives back one block big enough for nearly everything
    let big = arena.allocate(12 * 1024)?;
    arena.deallocate(big)?;
    Ok(())
}

#[test]
#[serial]
fn test_free_in_any_order_coalesces() -> Result<()> {
    cleanup_shared_memory();
    let arena = ShmArena::create(SEGMENT, 32 * 1024)?;
    let free_before = arena.free_bytes();

    let a = arena.allocate(512)?;
    let b = arena.allocate(512)?;
    let c = arena.allocate(512)?;
    let d = arena.allocate(512)?;

    arena.deallocate(b)?;
    arena.deallocate(d)?;
    arena.deallocate(a)?;
    arena.deallocate(c)?;

    assert_eq!(arena.free_bytes(), free_before);
    let whole = arena.allocate(free_before - 64)?;
    arena.deallocate(whole)?;
    Ok(())
}

#[test]
#[serial]
fn test_double_free_detected() -> Result<()> {
    cleanup_shared_memory();
    let arena = ShmArena::create(SEGMENT, 16 * 1024)?;

    let a = arena.allocate(64)?;
    let _b = arena.allocate(64)?;
    arena.deallocate(a)?;
    assert!(matches!(arena.deallocate(a), Err(ShmError::InvalidHandle(_))));
    assert!(matches!(
        arena.address_from_handle(arena.handle_from_address(a)?),
        Err(ShmError::InvalidHandle(_))
    ));
    assert_eq!(arena.allocation_count(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_interior_pointer_not_freed() -> Result<()> {
    cleanup_shared_memory();
    let arena = ShmArena::create(SEGMENT, 64 * 1024)?;

    let big = arena.allocate(4096)?;
    let used = arena.used_bytes();
    let inside = NonNull::new(unsafe { big.as_ptr().add(1024) }).expect("non-null");
    unsafe { std::ptr::write_bytes(big.as_ptr(), 0xFF, 4096) };

    assert!(matches!(arena.deallocate(inside), Err(ShmError::InvalidHandle(_))));
    assert!(matches!(
        arena.payload_capacity(arena.handle_from_address(inside)?),
        Err(ShmError::InvalidHandle(_))
    ));
    assert_eq!(arena.used_bytes(), used);
    assert_eq!(arena.allocation_count(), 1);

    let handle = arena.handle_from_address(big)?;
    assert!(arena.payload_capacity(handle)? >= 4096);
    arena.deallocate(big)?;
    assert_eq!(arena.used_bytes(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_received_handle_into_payload_is_rejected() -> Result<()> {
    cleanup_shared_memory();
    let arena = Arc::new(ShmArena::create(SEGMENT, 64 * 1024)?);
    let ctx = arena_context(&arena)?;

    let big = Message::with_size(&ctx, 4096)?;
    let small = Message::with_size(&ctx, 64)?;

    let wire = Envelope::new(8, big.handle() + 1024, 0).encode();
    let bogus = Message::from_envelope(&ctx, &wire)?;
    assert!(matches!(bogus.data(), Err(ShmError::InvalidHandle(_))));
    assert!(bogus.as_slice().is_err());
    drop(bogus);

    // Nothing was pushed onto the free list
    assert_eq!(arena.allocation_count(), 2);
    drop(big);
    drop(small);
    assert_eq!(arena.allocation_count(), 0);
    assert_eq!(arena.used_bytes(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_oversized_envelope_is_rejected() -> Result<()> {
    cleanup_shared_memory();
    let arena = Arc::new(ShmArena::create(SEGMENT, 64 * 1024)?);
    let ctx = arena_context(&arena)?;

    let mut sender = Message::with_size(&ctx, 16)?;
    let wire = Envelope::new(1 << 30, sender.handle(), 0).encode();
    sender.mark_transferred();

    let receiver = Message::from_envelope(&ctx, &wire)?;
    assert_eq!(receiver.size(), 1 << 30);
    assert!(matches!(
        receiver.as_slice(),
        Err(ShmError::OutOfRegion { region_id: 0, len, .. }) if len == 1 << 30
    ));

    // The receiver still owns and frees the real chunk
    drop(receiver);
    assert_eq!(arena.allocation_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_impossible_request_fails_without_waiting() -> Result<()> {
    cleanup_shared_memory();
    let arena = Arc::new(ShmArena::create(SEGMENT, 16 * 1024)?);
    let ctx = arena_context(&arena)?;

    let start = Instant::now();
    let result = Message::with_size(&ctx, 1 << 20);
    assert!(matches!(result, Err(ShmError::TooLarge { .. })));
    assert!(start.elapsed() < Duration::from_millis(5) * 5);
    assert!(!ctx.shutdown().is_triggered());
    Ok(())
}

#[test]
#[serial]
fn test_concurrent_allocations() -> Result<()> {
    cleanup_shared_memory();
    let arena = Arc::new(ShmArena::create(SEGMENT, 1024 * 1024)?);

    let mut handles = vec![];
    for thread_id in 0..4u8 {
        let arena = Arc::clone(&arena);
        handles.push(thread::spawn(move || -> Result<()> {
            for round in 0..200usize {
                let size = 16 + (round * 7) % 900;
                let ptr = arena.allocate(size)?;
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), thread_id, size) };
                let seen = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                assert!(seen.iter().all(|&b| b == thread_id), "chunk overlapped another thread");
                arena.deallocate(ptr)?;
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked")?;
    }
    assert_eq!(arena.allocation_count(), 0);
    assert_eq!(arena.used_bytes(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_messages_over_named_segment() -> Result<()> {
    cleanup_shared_memory();

    let sender_ctx = ContextBuilder::new()
        .with_segment_name(SEGMENT)
        .with_segment_size(256 * 1024)
        .with_region_prefix("dmxp_test_arena_region")
        .with_shutdown(ShutdownSignal::new())
        .create()?;
    let receiver_ctx = ContextBuilder::new()
        .with_segment_name(SEGMENT)
        .with_region_prefix("dmxp_test_arena_region")
        .with_shutdown(ShutdownSignal::new())
        .with_poll_interval(Duration::from_millis(5))
        .attach()?;

    let mut sent = Message::from_vec(&sender_ctx, b"zero copy payload".to_vec())?;
    let wire = sent.envelope_bytes().expect("initialized message has an envelope");
    sent.mark_transferred();
    drop(sent);

    let received = Message::from_envelope(&receiver_ctx, &wire)?;
    assert_eq!(received.as_slice()?, b"zero copy payload");
    Ok(())
}

fn arena_context(arena: &Arc<ShmArena>) -> Result<TransportContext> {
    ContextBuilder::new()
        .with_arena(Arc::clone(arena) as Arc<dyn ArenaManager>)
        .with_region_prefix("dmxp_test_arena_region")
        .with_shutdown(ShutdownSignal::new())
        .with_poll_interval(Duration::from_millis(5))
        .create()
}

fn cleanup_shared_memory() {
    // Clean up any existing shared memory files
    #[cfg(target_os = "linux")]
    {
        let path = format!("/dev/shm/{}", SEGMENT);
        if Path::new(&path).exists() {
            let _ = fs::remove_file(&path);
        }
    }
}
