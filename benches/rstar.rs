#![feature(test)]

extern crate test;

use rand::Rng;
use rstar_index::{Mbr, RTree, RectQuery, WithMbr};
use test::Bencher;

type Point3 = WithMbr<f64, 3, usize>;

fn generate_tree_with_size(count: usize) -> RTree<f64, 3, Point3> {
    let mut tree_map: RTree<f64, 3, Point3> = RTree::new(8, 32).unwrap();
    let mut rng = rand::thread_rng();
    for i in 0..count {
        let point = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
        tree_map.insert(WithMbr::new(Mbr::from_point(point), i));
    }
    tree_map
}

#[bench]
fn insert_rng_bench_3d_10(b: &mut Bencher) {
    b.iter(|| {
        generate_tree_with_size(10);
    });
}

#[bench]
fn insert_rng_bench_3d_100(b: &mut Bencher) {
    b.iter(|| {
        generate_tree_with_size(100);
    });
}

#[bench]
fn insert_rng_bench_3d_1000(b: &mut Bencher) {
    b.iter(|| {
        generate_tree_with_size(1000);
    });
}

#[bench]
fn insert_rng_bench_3d_10000(b: &mut Bencher) {
    b.iter(|| {
        generate_tree_with_size(10000);
    });
}

fn search_rng_bench_3d(b: &mut Bencher, size: usize) {
    let tree_map = generate_tree_with_size(size);
    let mut rng = rand::thread_rng();
    b.iter(|| {
        let lo = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
        let hi = [lo[0] + 0.1, lo[1] + 0.1, lo[2] + 0.1];
        tree_map.iter_query(RectQuery::Overlaps(Mbr::from_corners(lo, hi))).count();
    });
}

fn remove_rng_bench_3d(b: &mut Bencher, size: usize) {
    let mut tree_map = generate_tree_with_size(size);
    let mut rng = rand::thread_rng();
    b.iter(|| {
        let lo = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
        let hi = [lo[0] + 0.1, lo[1] + 0.1, lo[2] + 0.1];
        let removed = tree_map.remove(RectQuery::Overlaps(Mbr::from_corners(lo, hi)));
        for (_, item) in removed {
            tree_map.insert(item);
        }
    });
}

#[bench]
fn search_rng_bench_3d_10(b: &mut Bencher) {
    search_rng_bench_3d(b, 10);
}

#[bench]
fn search_rng_bench_3d_100(b: &mut Bencher) {
    search_rng_bench_3d(b, 100);
}

#[bench]
fn search_rng_bench_3d_1000(b: &mut Bencher) {
    search_rng_bench_3d(b, 1000);
}

#[bench]
fn search_rng_bench_3d_10000(b: &mut Bencher) {
    search_rng_bench_3d(b, 10000);
}

#[bench]
fn remove_rng_bench_3d_10(b: &mut Bencher) {
    remove_rng_bench_3d(b, 10);
}

#[bench]
fn remove_rng_bench_3d_100(b: &mut Bencher) {
    remove_rng_bench_3d(b, 100);
}

#[bench]
fn remove_rng_bench_3d_1000(b: &mut Bencher) {
    remove_rng_bench_3d(b, 1000);
}

#[bench]
fn remove_rng_bench_3d_10000(b: &mut Bencher) {
    remove_rng_bench_3d(b, 10000);
}
