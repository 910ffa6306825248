use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sepconv::{
    ActivationKind, CacheInfo, CapTier, ConvShape, EngineConfig, MergedConvolution, MergedParam,
    Precision,
};

fn block(c_in: usize, c_mid: usize, c_out: usize, h: usize, w: usize, stride: usize) -> MergedParam {
    MergedParam::new(
        1,
        vec![
            ConvShape::new(
                c_in,
                h,
                w,
                c_mid,
                (1, 1),
                (1, 1),
                (0, 0, 0, 0),
                1,
                ActivationKind::Hswish,
            ),
            ConvShape::new(
                c_mid,
                h,
                w,
                c_mid,
                (3, 3),
                (stride, stride),
                (1, 1, 1, 1),
                c_mid,
                ActivationKind::Hswish,
            ),
            ConvShape::new(
                c_mid,
                h / stride,
                w / stride,
                c_out,
                (1, 1),
                (1, 1),
                (0, 0, 0, 0),
                1,
                ActivationKind::Identity,
            ),
        ],
        false,
        Precision::F32,
    )
}

fn prepared(param: MergedParam, tier: CapTier) -> (MergedConvolution, Vec<f32>, Vec<f32>) {
    let config = EngineConfig {
        tier: Some(tier),
        cache: CacheInfo::default(),
        perf: None,
    };
    let weights: Vec<Vec<f32>> = param
        .conv
        .iter()
        .map(|shape| {
            (0..shape.weight_len())
                .map(|v| ((v % 31) as f32 - 15.0) * 0.01)
                .collect()
        })
        .collect();
    let mut m = MergedConvolution::init(param, &config).unwrap();
    let w: Vec<&[f32]> = weights.iter().map(|v| v.as_slice()).collect();
    let hswish = [3.0f32, 1.0 / 6.0];
    m.set_params(&w, &[&[], &[], &[]], &[&hswish, &hswish, &[]]);
    let src = vec![0.5f32; m.src_dims().elements()];
    let dst = vec![0f32; m.dst_dims().elements()];
    (m, src, dst)
}

fn bench_forward_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_forward_56x56");
    for tier in [
        CapTier::Scalar,
        CapTier::V128,
        CapTier::V256,
        CapTier::MatrixTile,
    ] {
        let (mut m, src, mut dst) = prepared(block(16, 96, 32, 56, 56, 1), tier);
        let mut scratch = m.scratch();
        group.bench_function(format!("{tier:?}"), |b| {
            b.iter(|| {
                m.forward(black_box(&src), Some(&mut scratch), &mut dst);
                black_box(&dst);
            })
        });
    }
    group.finish();
}

fn bench_forward_strided(c: &mut Criterion) {
    let (mut m, src, mut dst) = prepared(block(24, 144, 40, 28, 28, 2), CapTier::V256);
    let mut scratch = m.scratch();
    c.bench_function("merged_forward_28x28_stride2", |b| {
        b.iter(|| {
            m.forward(black_box(&src), Some(&mut scratch), &mut dst);
            black_box(&dst);
        })
    });
}

criterion_group!(benches, bench_forward_tiers, bench_forward_strided);
criterion_main!(benches);
