use divan::AllocProfiler;

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

fn sample() -> wz::WzArchive {
    use wz::tree::CanvasData;
    use wz::{Payload, WzArchive, WzValue, WzVariant};

    let mut archive = WzArchive::create("Mob.wz", 83, WzVariant::Gms).unwrap();
    let root = archive.root();
    let tree = archive.tree_mut();
    for i in 0..32 {
        let image = tree.add_image(root, &format!("{:07}.img", 100100 + i)).unwrap();
        let info = tree.add_property(image, "info", WzValue::SubProperty).unwrap();
        tree.add_property(info, "maxHP", WzValue::Int(i * 100)).unwrap();
        tree.add_property(info, "speed", WzValue::Float(-1.5)).unwrap();
        tree.add_property(info, "name", WzValue::String("Blue Snail".into())).unwrap();
        for frame in 0..8 {
            let canvas = tree
                .add_property(
                    image,
                    &frame.to_string(),
                    WzValue::Canvas(CanvasData {
                        width: 32,
                        height: 32,
                        format: 2,
                        format2: 0,
                        payload: Payload::Loaded(vec![frame as u8; 512]),
                    }),
                )
                .unwrap();
            tree.add_vector(canvas, "origin", 16, 32).unwrap();
        }
    }
    archive
}

fn saved() -> Vec<u8> {
    sample()
        .save(std::io::Cursor::new(Vec::new()))
        .unwrap()
        .into_inner()
}

pub mod keystream {
    use divan::Bencher;
    use wz_crypto::Keystream;

    #[divan::bench(args = [4096, 65536])]
    fn derive(bencher: Bencher, len: usize) {
        bencher.bench(|| {
            divan::black_box(Keystream::with_len([0x4D, 0x23, 0xC7, 0x2B], len));
        });
    }
}

pub mod read {
    use divan::Bencher;
    use std::io::Cursor;
    use wz::{OpenOptions, WzArchive, WzVariant};

    fn options() -> OpenOptions {
        OpenOptions::builder().variant(WzVariant::Gms).build()
    }

    #[divan::bench]
    fn open_with_discovery(bencher: Bencher) {
        bencher.with_inputs(super::saved).bench_values(|data| {
            divan::black_box(WzArchive::open(Cursor::new(data), options()).unwrap());
        });
    }

    #[divan::bench(sample_count = 10)]
    fn materialize_all(bencher: Bencher) {
        bencher
            .with_inputs(|| WzArchive::open(Cursor::new(super::saved()), options()).unwrap())
            .bench_refs(|archive| {
                divan::black_box(archive.paths().unwrap());
            });
    }
}

pub mod write {
    use divan::Bencher;

    #[divan::bench]
    fn serialize_image(bencher: Bencher) {
        let mut archive = super::sample();
        let image = archive.tree().images(archive.root()).next().unwrap();
        bencher.bench_local(move || {
            divan::black_box(archive.serialize_image(image).unwrap());
        });
    }

    #[divan::bench(sample_count = 10)]
    fn save(bencher: Bencher) {
        let mut archive = super::sample();
        bencher.bench_local(move || {
            divan::black_box(archive.save(std::io::Cursor::new(Vec::new())).unwrap());
        });
    }
}
