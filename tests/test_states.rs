// tests/test_states.rs — CountState, ListState and ImageState transfers.
//
// Run with `cargo test --test test_states`.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use gpuwork::ledger::{Action, ResourceKind};
use gpuwork::platform::host::HostPlatform;
use gpuwork::{
    CountState, Error, Image, ImageState, Item, ListState, PixelFormat, Platform, Worker,
    WorkerConfig,
};

fn host_worker() -> (Arc<HostPlatform>, Worker) {
    let p = Arc::new(HostPlatform::new());
    let d = p.devices().unwrap().remove(0);
    let w = Worker::with_config(p.clone(), d, WorkerConfig::default().journal(true)).unwrap();
    (p, w)
}

// ===== CountState =====

#[test]
fn count_round_trip() {
    let (_p, w) = host_worker();
    let c = CountState::new(&w, 10).unwrap();
    assert_eq!(c.get_count().unwrap(), 0, "new counters start at zero");
    for v in [1, 7, 100, 1 << 20, i32::MAX] {
        c.set_count(v).unwrap();
        assert_eq!(c.get_count().unwrap(), v);
    }
    c.close().unwrap();
    w.close().unwrap();
}

#[test]
fn valid_count_is_clamped() {
    let (_p, w) = host_worker();
    let c = CountState::new(&w, 10).unwrap();
    c.set_count(-4).unwrap();
    assert_eq!(c.get_count().unwrap(), -4);
    assert_eq!(c.valid_count().unwrap(), 0);
    c.set_count(25).unwrap();
    assert_eq!(c.get_count().unwrap(), 25);
    assert_eq!(c.valid_count().unwrap(), 10);
    c.close().unwrap();
    w.close().unwrap();
}

#[test]
fn zero_sized_count_is_rejected() {
    let (p, w) = host_worker();
    assert!(matches!(CountState::new(&w, 0), Err(Error::InvalidArgument(_))));
    assert_eq!(p.live_mems(), 0);
    w.close().unwrap();
}

// ===== ListState =====

#[test]
fn list_shape() {
    let (_p, w) = host_worker();
    let l = ListState::<f32>::new(&w, 100, 3).unwrap();
    assert_eq!(l.size(), 100);
    assert_eq!(l.each(), 3);
    assert_eq!(l.total(), 300);
    assert_eq!(l.bytes(), 1200);
    assert_eq!(l.item().name, "f32");
    assert_eq!(l.stage().len(), 300);
    l.close().unwrap();
    w.close().unwrap();
}

#[test]
fn list_stage_round_trip() {
    let (_p, w) = host_worker();
    let l = ListState::<u32>::new(&w, 4, 2).unwrap();
    for (i, v) in l.stage_mut().iter_mut().enumerate() {
        *v = i as u32 * 10;
    }
    l.write().unwrap();
    l.zero();
    assert!(l.stage().iter().all(|&v| v == 0));
    l.read().unwrap();
    assert_eq!(&*l.stage(), &[0, 10, 20, 30, 40, 50, 60, 70]);

    l.write_zero().unwrap();
    l.read().unwrap();
    assert!(l.stage().iter().all(|&v| v == 0));
    l.close().unwrap();
    w.close().unwrap();
}

#[test]
fn list_items_follow_the_counter() {
    let (_p, w) = host_worker();
    let l = ListState::<i32>::new(&w, 8, 2).unwrap();
    l.set_items(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(l.get_count().unwrap(), 3);
    assert_eq!(l.get_items().unwrap(), vec![1, 2, 3, 4, 5, 6]);

    l.set_count(1).unwrap();
    assert_eq!(l.get_items().unwrap(), vec![1, 2]);

    l.set_count(100).unwrap();
    assert_eq!(l.get_items().unwrap().len(), 16, "clamped to capacity");

    assert!(matches!(l.set_items(&[1, 2, 3]), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(l.set_items(&[0; 18]), Err(Error::ShapeMismatch { .. })));
    l.close().unwrap();
    w.close().unwrap();
}

#[test]
fn list_copy_between_lists() {
    let (_p, w) = host_worker();
    let a = ListState::<i32>::new(&w, 4, 1).unwrap();
    let b = ListState::<i32>::new(&w, 4, 1).unwrap();
    let c = ListState::<i32>::new(&w, 5, 1).unwrap();
    a.set_items(&[9, 8]).unwrap();

    b.copy_from(&a).unwrap();
    assert_eq!(b.get_count().unwrap(), 2);
    assert_eq!(b.get_items().unwrap(), vec![9, 8]);

    assert!(matches!(c.copy_from(&a), Err(Error::ShapeMismatch { .. })));
    c.copy_from_via_host(&a).unwrap();
    assert_eq!(c.get_items().unwrap(), vec![9, 8]);

    c.close().unwrap();
    b.close().unwrap();
    a.close().unwrap();
    w.close().unwrap();
}

#[test]
fn list_copy_across_workers_goes_through_host() {
    let p = Arc::new(HostPlatform::new());
    let d = p.devices().unwrap().remove(0);
    let w1 = Worker::new(p.clone(), d.clone()).unwrap();
    let w2 = Worker::new(p.clone(), d).unwrap();
    let a = ListState::<i32>::new(&w1, 4, 1).unwrap();
    let b = ListState::<i32>::new(&w2, 4, 1).unwrap();
    a.set_items(&[5]).unwrap();

    assert!(matches!(b.copy_from(&a), Err(Error::InvalidArgument(_))));
    b.copy_from_via_host(&a).unwrap();
    assert_eq!(b.get_items().unwrap(), vec![5]);

    b.close().unwrap();
    a.close().unwrap();
    w2.close().unwrap();
    w1.close().unwrap();
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Track {
    x: f32,
    y: f32,
    id: u32,
    age: u32,
}

impl Item for Track {
    const NAME: &'static str = "Track";
}

#[test]
fn list_of_records() {
    let (_p, w) = host_worker();
    let l = ListState::<Track>::new(&w, 3, 1).unwrap();
    assert_eq!(l.bytes(), 48);
    let t = Track { x: 1.5, y: -2.0, id: 7, age: 3 };
    l.set_items(&[t]).unwrap();
    assert_eq!(l.get_items().unwrap(), vec![t]);
    l.close().unwrap();
    w.close().unwrap();
}

#[test]
fn list_release_order_is_reverse_of_acquisition() {
    let (p, w) = host_worker();
    let l = ListState::<i32>::new(&w, 16, 2).unwrap();
    l.close().unwrap();
    assert_eq!(p.live_mems(), 0);

    let journal = w.journal();
    let acquired: Vec<_> = journal
        .iter()
        .filter(|e| e.action == Action::Acquire && e.kind != ResourceKind::Context)
        .filter(|e| e.kind != ResourceKind::Queue)
        .map(|e| e.id)
        .collect();
    let mut released: Vec<_> = journal
        .iter()
        .filter(|e| e.action == Action::Release)
        .map(|e| e.id)
        .collect();
    assert_eq!(acquired.len(), 4, "counter buffer and stage, item buffer and stage");
    released.reverse();
    assert_eq!(acquired, released);
    w.close().unwrap();
}

// ===== ImageState =====

#[test]
fn image_write_read() {
    let (_p, w) = host_worker();
    let s = ImageState::new(&w, PixelFormat::GRAY8, 64, 48).unwrap();
    assert_eq!(s.nxy(), 3072);
    let mut img = Image::<u8>::new(64, 48);
    img.set(10, 20, 99);
    s.write(&img).unwrap();
    let back: Image<u8> = s.read().unwrap();
    assert_eq!(back.get(10, 20), 99);
    assert_eq!(back, img);
    s.close().unwrap();
    w.close().unwrap();
}

#[test]
fn image_shape_mismatch_leaves_content() {
    let (_p, w) = host_worker();
    let s = ImageState::new(&w, PixelFormat::GRAY8, 64, 48).unwrap();
    s.write_gray(&vec![7u8; 64 * 48]).unwrap();

    let wrong = Image::<u8>::new(48, 64);
    assert!(matches!(s.write(&wrong), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(s.write_gray(&[0u8; 100]), Err(Error::ShapeMismatch { .. })));
    assert!(s.read_bytes().unwrap().iter().all(|&b| b == 7));
    s.close().unwrap();
    w.close().unwrap();
}

#[test]
fn float_image() {
    let (_p, w) = host_worker();
    let s = ImageState::new(&w, PixelFormat::GRAYF32, 3, 2).unwrap();
    let img = Image::from_vec(3, 2, vec![0.5f32, 1.0, 1.5, 2.0, 2.5, 3.0]);
    s.write(&img).unwrap();
    assert_eq!(s.read::<f32>().unwrap(), img);
    assert!(matches!(s.write_gray(&[0; 6]), Err(Error::ShapeMismatch { .. })));
    s.close().unwrap();
    w.close().unwrap();
}
