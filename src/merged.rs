//! Pipeline orchestrator: owns the reorganised parameters, the tiling
//! plan and the bound kernels, and drives the per-super-tile,
//! per-row-window fused loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use half::bf16;

use crate::alg::AlgParam;
use crate::caps::{detect_tier, CapTier, EngineConfig, PerfSink, Precision};
use crate::kernels::activations::ActivationKind;
use crate::kernels::{self, convert, gemm, DwKind, RowGeo, Rows, RowsMut, TileFlags, WeightRef};
use crate::param::{ConvShape, InitError, MergedParam, Topology};
use crate::tensor::{copy_rows, NhwcDims};

/// Pointwise weights in the precision of the compressed path.
enum PwWeights {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
}

impl PwWeights {
    fn slice(&self, off: usize, len: usize) -> WeightRef<'_> {
        match self {
            PwWeights::F32(v) => WeightRef::F32(&v[off..off + len]),
            PwWeights::Bf16(v) => WeightRef::Bf16(&v[off..off + len]),
        }
    }

    fn f32s(&self) -> &[f32] {
        match self {
            PwWeights::F32(v) => v,
            PwWeights::Bf16(_) => unreachable!("matrix-tile path bound with compressed weights"),
        }
    }

    fn len(&self) -> usize {
        match self {
            PwWeights::F32(v) => v.len(),
            PwWeights::Bf16(v) => v.len(),
        }
    }

    fn bytes(&self) -> usize {
        match self {
            PwWeights::F32(v) => v.len() * 4,
            PwWeights::Bf16(v) => v.len() * 2,
        }
    }
}

/// Kernel selection resolved at construction.
#[derive(Debug, Clone, Copy)]
struct Binding {
    tier: CapTier,
    lanes: usize,
    dw: DwKind,
    gemm_input: bool,
    gemm_output: bool,
}

impl Binding {
    fn bind(param: &MergedParam, topo: Topology, tier: CapTier) -> Binding {
        let f32_path = param.precision == Precision::F32;
        let matrix = tier == CapTier::MatrixTile;
        Binding {
            tier,
            lanes: tier.lanes(),
            dw: DwKind::select(param.depthwise()),
            // The matrix-tile pointwise kernels are only legal for f32
            // buffers and 1x1 geometry; illegal stages fall back to the
            // 16-lane kernels of the same tier.
            gemm_input: matrix && f32_path && topo != Topology::Dc && param.conv[0].is_1x1(),
            gemm_output: matrix && f32_path && topo != Topology::Cd,
        }
    }
}

/// Caller-ownable ring buffers for one `forward` call.
///
/// Obtain one from [`MergedConvolution::scratch`]; passing `None` to
/// `forward` instead makes the pipeline allocate and keep its own.
pub struct Scratch {
    buf0: Vec<bf16>,
    buf1: Vec<f32>,
    buf2f: Vec<f32>,
    buf2h: Vec<bf16>,
}

/// A fused expand / depthwise / project convolution pipeline.
///
/// Construction validates the shapes, binds kernels for a capability
/// tier and sizes the tiling plan; `set_params` copies the caller's
/// weights into the internal layout; `forward` is infallible.
pub struct MergedConvolution {
    param: MergedParam,
    topo: Topology,
    alg: AlgParam,
    binding: Binding,
    weight_i: Option<PwWeights>,
    weight_d: Vec<f32>,
    weight_o: Option<PwWeights>,
    bias: Vec<Vec<f32>>,
    act_params: Vec<Vec<f32>>,
    params_set: bool,
    own_scratch: Option<Scratch>,
    perf: Option<Arc<dyn PerfSink + Send + Sync>>,
    src_dims: NhwcDims,
    dst_dims: NhwcDims,
}

impl MergedConvolution {
    pub fn init(param: MergedParam, config: &EngineConfig) -> Result<Self, InitError> {
        param.validate()?;
        let topo = param.topology();
        let tier = config.tier.unwrap_or_else(detect_tier);
        let binding = Binding::bind(&param, topo, tier);
        let alg = AlgParam::plan(&param, binding.lanes, &config.cache);
        let first = &param.conv[0];
        let last = param.conv.last().unwrap();
        let src_dims = NhwcDims {
            n: param.batch,
            h: first.src_h,
            w: first.src_w,
            c: first.src_c,
        };
        let dst_dims = NhwcDims {
            n: param.batch,
            h: last.dst_h,
            w: last.dst_w,
            c: last.dst_c,
        };
        let stages = param.conv.len();
        Ok(Self {
            param,
            topo,
            alg,
            binding,
            weight_i: None,
            weight_d: Vec::new(),
            weight_o: None,
            bias: vec![Vec::new(); stages],
            act_params: vec![Vec::new(); stages],
            params_set: false,
            own_scratch: None,
            perf: config.perf.clone(),
            src_dims,
            dst_dims,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topo
    }

    pub fn tier(&self) -> CapTier {
        self.binding.tier
    }

    pub fn src_dims(&self) -> NhwcDims {
        self.src_dims
    }

    pub fn dst_dims(&self) -> NhwcDims {
        self.dst_dims
    }

    /// Bytes of ring-buffer scratch one `forward` call needs.
    pub fn external_buffer_size(&self) -> usize {
        self.alg.scratch_bytes(self.param.precision)
    }

    /// Bytes held by the reorganised weight, bias and activation
    /// parameter buffers.
    pub fn internal_buffer_size(&self) -> usize {
        let mut bytes = self.weight_d.len() * 4;
        if let Some(w) = &self.weight_i {
            bytes += w.bytes();
        }
        if let Some(w) = &self.weight_o {
            bytes += w.bytes();
        }
        for v in self.bias.iter().chain(self.act_params.iter()) {
            bytes += v.len() * 4;
        }
        bytes
    }

    /// Allocate ring buffers sized for this pipeline's plan.
    pub fn scratch(&self) -> Scratch {
        let a = &self.alg;
        let compressed = self.param.precision == Precision::Bf16;
        Scratch {
            buf0: vec![bf16::ZERO; a.size_b[0]],
            buf1: vec![0f32; a.size_b[1]],
            buf2f: if compressed {
                Vec::new()
            } else {
                vec![0f32; a.size_b[2]]
            },
            buf2h: if compressed {
                vec![bf16::ZERO; a.size_b[2]]
            } else {
                Vec::new()
            },
        }
    }

    /// Install weights, biases and activation parameters, one entry per
    /// stage. Pointwise weights are expected in `[ky][kx][src_c][dst_c]`
    /// order, depthwise in `[ky][kx][c]`; an empty bias slice means zero
    /// bias. Everything is copied (and rounded, on the compressed path),
    /// so the caller may free its arrays afterwards.
    pub fn set_params(&mut self, weights: &[&[f32]], bias: &[&[f32]], params: &[&[f32]]) {
        let n = self.param.conv.len();
        assert_eq!(weights.len(), n, "one weight array per stage");
        assert_eq!(bias.len(), n, "one bias array per stage");
        assert_eq!(params.len(), n, "one activation parameter array per stage");
        let precision = self.param.precision;
        for i in 0..n {
            let shape = self.param.conv[i].clone();
            assert_eq!(weights[i].len(), shape.weight_len(), "stage {i} weight length");
            if shape.group != 1 {
                self.weight_d = reorder_depthwise(&shape, weights[i]);
            } else if i == 0 {
                self.weight_i = Some(reorder_input(&shape, weights[i], precision));
            } else {
                self.weight_o = Some(reorder_output(&shape, weights[i], precision));
            }
            self.bias[i] = if bias[i].is_empty() {
                vec![0f32; shape.dst_c]
            } else {
                assert_eq!(bias[i].len(), shape.dst_c, "stage {i} bias length");
                bias[i].to_vec()
            };
            self.act_params[i] = shape.activation.canonical_params(params[i], shape.dst_c);
        }
        self.params_set = true;
    }

    /// Run the whole batch. `src` and `dst` are channel-last tensors of
    /// the pipeline's input and output dimensions.
    pub fn forward(&mut self, src: &[f32], scratch: Option<&mut Scratch>, dst: &mut [f32]) {
        assert!(self.params_set, "set_params must be called before forward");
        assert_eq!(src.len(), self.src_dims.elements(), "source tensor length");
        assert_eq!(dst.len(), self.dst_dims.elements(), "output tensor length");
        let mut own = None;
        let s: &mut Scratch = match scratch {
            Some(s) => s,
            None => {
                own = Some(self.own_scratch.take().unwrap_or_else(|| self.scratch()));
                own.as_mut().unwrap()
            }
        };
        debug_assert!(s.buf1.len() >= self.alg.size_b[1]);

        let mut spent = [Duration::ZERO; 4];
        match self.topo {
            Topology::Cdc => self.run_cdc(src, s, dst, &mut spent),
            Topology::Cd => self.run_cd(src, s, dst, &mut spent),
            Topology::Dc => self.run_dc(src, s, dst, &mut spent),
        }
        if let Some(sink) = &self.perf {
            for (name, d) in ["convert", "expand", "depthwise", "project"]
                .iter()
                .zip(spent.iter())
            {
                if *d > Duration::ZERO {
                    sink.record(name, *d);
                }
            }
        }
        if let Some(own) = own {
            self.own_scratch = Some(own);
        }
    }

    fn run_cdc(&self, src: &[f32], s: &mut Scratch, dst: &mut [f32], spent: &mut [Duration; 4]) {
        let p = &self.param;
        let (c0, c1, c2) = (&p.conv[0], &p.conv[1], &p.conv[2]);
        let a = &self.alg;
        let compressed = p.precision == Precision::Bf16;
        let enabled = self.perf.is_some();
        let mid_c = c1.dst_c;
        let src_flat = RowGeo::flat(c0.src_w, c0.src_c, 0);
        let buf0_geo = if compressed {
            RowGeo::ring(a.buf_h[0], c0.src_w, c0.src_c)
        } else {
            src_flat
        };
        let buf1_geo = RowGeo::ring(a.buf_h[1], c1.src_w, a.ma_c);
        let buf2_geo = RowGeo::ring(a.buf_h[2], c1.dst_w, a.ma_c);
        let dst_flat = RowGeo::flat(c2.dst_w, c2.dst_c, 0);
        let weight_i = self.weight_i.as_ref().unwrap();
        let weight_o = self.weight_o.as_ref().unwrap();

        for b in 0..p.batch {
            let src_b = &src[b * self.src_dims.per_image()..(b + 1) * self.src_dims.per_image()];
            let dst_b =
                &mut dst[b * self.dst_dims.per_image()..(b + 1) * self.dst_dims.per_image()];
            let mut c = 0;
            while c < mid_c {
                let tile = a.ma_c.min(mid_c - c);
                let (mut y0, mut y1, mut y2) = (0usize, 0usize, 0usize);
                while y2 < c1.dst_h {
                    let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], c1.dst_h);
                    let e1 = (y1 + a.y_step[1]).clamp(a.y_start[1], c1.src_h);
                    let e0 = (y0 + a.y_step[0]).clamp(a.y_start[0], c0.src_h);
                    if compressed {
                        timed(enabled, &mut spent[0], || {
                            convert::to_bf16_rows(src_b, src_flat, y0, e0, &mut s.buf0, buf0_geo);
                        });
                    }
                    timed(enabled, &mut spent[1], || {
                        let bias0 = &self.bias[0][c..];
                        let p0 = stage_params(&self.act_params[0], c0.activation, c);
                        if self.binding.gemm_input {
                            let w = &weight_i.f32s()[c * a.dw[0]..(c + tile) * a.dw[0]];
                            gemm::input_1x1(
                                src_b,
                                src_flat,
                                c0,
                                tile,
                                y1,
                                e1,
                                w,
                                bias0,
                                c0.activation,
                                p0,
                                &mut s.buf1,
                                buf1_geo,
                            );
                        } else {
                            let rows = if compressed {
                                Rows::Bf16(&s.buf0)
                            } else {
                                Rows::F32(src_b)
                            };
                            kernels::run_input(
                                self.binding.lanes,
                                rows,
                                buf0_geo,
                                c0,
                                tile,
                                y1,
                                e1,
                                weight_i.slice(c * a.dw[0], tile * a.dw[0]),
                                bias0,
                                c0.activation,
                                p0,
                                &mut s.buf1,
                                buf1_geo,
                            );
                        }
                    });
                    timed(enabled, &mut spent[2], || {
                        let dw_dst = if compressed {
                            RowsMut::Bf16(&mut s.buf2h)
                        } else {
                            RowsMut::F32(&mut s.buf2f)
                        };
                        kernels::run_depthwise(
                            self.binding.lanes,
                            self.binding.dw,
                            &s.buf1,
                            buf1_geo,
                            c1,
                            tile,
                            y2,
                            e2,
                            &self.weight_d[c * a.dw[1]..(c + tile) * a.dw[1]],
                            &self.bias[1][c..],
                            c1.activation,
                            stage_params(&self.act_params[1], c1.activation, c),
                            dw_dst,
                            buf2_geo,
                        );
                    });
                    if p.add && c == 0 {
                        copy_rows(src_b, dst_b, c0.src_w * c0.src_c, y2, e2);
                    }
                    timed(enabled, &mut spent[3], || {
                        let flags = TileFlags {
                            zero: c == 0 && !p.add,
                            last: c + tile == mid_c,
                        };
                        if self.binding.gemm_output {
                            gemm::output_1x1(
                                &s.buf2f,
                                buf2_geo,
                                c2,
                                tile,
                                c,
                                y2,
                                e2,
                                weight_o.f32s(),
                                &self.bias[2],
                                c2.activation,
                                &self.act_params[2],
                                dst_b,
                                dst_flat,
                                flags,
                            );
                        } else {
                            let rows = if compressed {
                                Rows::Bf16(&s.buf2h)
                            } else {
                                Rows::F32(&s.buf2f)
                            };
                            kernels::run_output(
                                self.binding.lanes,
                                rows,
                                buf2_geo,
                                c2,
                                tile,
                                c,
                                y2,
                                e2,
                                weight_o.slice(0, weight_o.len()),
                                &self.bias[2],
                                c2.activation,
                                &self.act_params[2],
                                dst_b,
                                dst_flat,
                                flags,
                            );
                        }
                    });
                    y2 = e2;
                    y1 = e1;
                    y0 = e0;
                }
                c += tile;
            }
        }
    }

    fn run_cd(&self, src: &[f32], s: &mut Scratch, dst: &mut [f32], spent: &mut [Duration; 4]) {
        let p = &self.param;
        let (c0, c1) = (&p.conv[0], &p.conv[1]);
        let a = &self.alg;
        let compressed = p.precision == Precision::Bf16;
        let enabled = self.perf.is_some();
        let mid_c = c1.dst_c;
        let src_flat = RowGeo::flat(c0.src_w, c0.src_c, 0);
        let buf0_geo = if compressed {
            RowGeo::ring(a.buf_h[0], c0.src_w, c0.src_c)
        } else {
            src_flat
        };
        let buf1_geo = RowGeo::ring(a.buf_h[1], c1.src_w, a.ma_c);
        let weight_i = self.weight_i.as_ref().unwrap();

        for b in 0..p.batch {
            let src_b = &src[b * self.src_dims.per_image()..(b + 1) * self.src_dims.per_image()];
            let dst_b =
                &mut dst[b * self.dst_dims.per_image()..(b + 1) * self.dst_dims.per_image()];
            let mut c = 0;
            while c < mid_c {
                let tile = a.ma_c.min(mid_c - c);
                let dst_geo = RowGeo::flat(c1.dst_w, c1.dst_c, c);
                let (mut y0, mut y1, mut y2) = (0usize, 0usize, 0usize);
                while y2 < c1.dst_h {
                    let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], c1.dst_h);
                    let e1 = (y1 + a.y_step[1]).clamp(a.y_start[1], c1.src_h);
                    let e0 = (y0 + a.y_step[0]).clamp(a.y_start[0], c0.src_h);
                    if compressed {
                        timed(enabled, &mut spent[0], || {
                            convert::to_bf16_rows(src_b, src_flat, y0, e0, &mut s.buf0, buf0_geo);
                        });
                    }
                    timed(enabled, &mut spent[1], || {
                        let bias0 = &self.bias[0][c..];
                        let p0 = stage_params(&self.act_params[0], c0.activation, c);
                        if self.binding.gemm_input {
                            let w = &weight_i.f32s()[c * a.dw[0]..(c + tile) * a.dw[0]];
                            gemm::input_1x1(
                                src_b,
                                src_flat,
                                c0,
                                tile,
                                y1,
                                e1,
                                w,
                                bias0,
                                c0.activation,
                                p0,
                                &mut s.buf1,
                                buf1_geo,
                            );
                        } else {
                            let rows = if compressed {
                                Rows::Bf16(&s.buf0)
                            } else {
                                Rows::F32(src_b)
                            };
                            kernels::run_input(
                                self.binding.lanes,
                                rows,
                                buf0_geo,
                                c0,
                                tile,
                                y1,
                                e1,
                                weight_i.slice(c * a.dw[0], tile * a.dw[0]),
                                bias0,
                                c0.activation,
                                p0,
                                &mut s.buf1,
                                buf1_geo,
                            );
                        }
                    });
                    timed(enabled, &mut spent[2], || {
                        kernels::run_depthwise(
                            self.binding.lanes,
                            self.binding.dw,
                            &s.buf1,
                            buf1_geo,
                            c1,
                            tile,
                            y2,
                            e2,
                            &self.weight_d[c * a.dw[1]..(c + tile) * a.dw[1]],
                            &self.bias[1][c..],
                            c1.activation,
                            stage_params(&self.act_params[1], c1.activation, c),
                            RowsMut::F32(dst_b),
                            dst_geo,
                        );
                    });
                    y2 = e2;
                    y1 = e1;
                    y0 = e0;
                }
                c += tile;
            }
        }
    }

    fn run_dc(&self, src: &[f32], s: &mut Scratch, dst: &mut [f32], spent: &mut [Duration; 4]) {
        let p = &self.param;
        let (c0, c1) = (&p.conv[0], &p.conv[1]);
        let a = &self.alg;
        let compressed = p.precision == Precision::Bf16;
        let enabled = self.perf.is_some();
        let mid_c = c0.dst_c;
        let buf2_geo = RowGeo::ring(a.buf_h[2], c0.dst_w, a.ma_c);
        let dst_flat = RowGeo::flat(c1.dst_w, c1.dst_c, 0);
        let weight_o = self.weight_o.as_ref().unwrap();

        for b in 0..p.batch {
            let src_b = &src[b * self.src_dims.per_image()..(b + 1) * self.src_dims.per_image()];
            let dst_b =
                &mut dst[b * self.dst_dims.per_image()..(b + 1) * self.dst_dims.per_image()];
            let mut c = 0;
            while c < mid_c {
                let tile = a.ma_c.min(mid_c - c);
                let src_geo = RowGeo::flat(c0.src_w, c0.src_c, c);
                let mut y2 = 0usize;
                while y2 < c0.dst_h {
                    let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], c0.dst_h);
                    timed(enabled, &mut spent[2], || {
                        let dw_dst = if compressed {
                            RowsMut::Bf16(&mut s.buf2h)
                        } else {
                            RowsMut::F32(&mut s.buf2f)
                        };
                        kernels::run_depthwise(
                            self.binding.lanes,
                            self.binding.dw,
                            src_b,
                            src_geo,
                            c0,
                            tile,
                            y2,
                            e2,
                            &self.weight_d[c * a.dw[1]..(c + tile) * a.dw[1]],
                            &self.bias[0][c..],
                            c0.activation,
                            stage_params(&self.act_params[0], c0.activation, c),
                            dw_dst,
                            buf2_geo,
                        );
                    });
                    if p.add && c == 0 {
                        copy_rows(src_b, dst_b, c0.src_w * c0.src_c, y2, e2);
                    }
                    timed(enabled, &mut spent[3], || {
                        let flags = TileFlags {
                            zero: c == 0 && !p.add,
                            last: c + tile == mid_c,
                        };
                        if self.binding.gemm_output {
                            gemm::output_1x1(
                                &s.buf2f,
                                buf2_geo,
                                c1,
                                tile,
                                c,
                                y2,
                                e2,
                                weight_o.f32s(),
                                &self.bias[1],
                                c1.activation,
                                &self.act_params[1],
                                dst_b,
                                dst_flat,
                                flags,
                            );
                        } else {
                            let rows = if compressed {
                                Rows::Bf16(&s.buf2h)
                            } else {
                                Rows::F32(&s.buf2f)
                            };
                            kernels::run_output(
                                self.binding.lanes,
                                rows,
                                buf2_geo,
                                c1,
                                tile,
                                c,
                                y2,
                                e2,
                                weight_o.slice(0, weight_o.len()),
                                &self.bias[1],
                                c1.activation,
                                &self.act_params[1],
                                dst_b,
                                dst_flat,
                                flags,
                            );
                        }
                    });
                    y2 = e2;
                }
                c += tile;
            }
        }
    }
}

#[inline]
fn timed<R>(enabled: bool, acc: &mut Duration, f: impl FnOnce() -> R) -> R {
    if enabled {
        let t0 = Instant::now();
        let r = f();
        *acc += t0.elapsed();
        r
    } else {
        f()
    }
}

fn stage_params(params: &[f32], act: ActivationKind, c: usize) -> &[f32] {
    if act.per_channel() {
        &params[c..]
    } else {
        params
    }
}

fn pack(values: Vec<f32>, precision: Precision) -> PwWeights {
    match precision {
        Precision::F32 => PwWeights::F32(values),
        Precision::Bf16 => PwWeights::Bf16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
    }
}

/// `[ky][kx][src_c][dst_c]` to `[dst_c][ky][kx][src_c]`, so each output
/// channel's taps are contiguous and a channel super-tile is one slice.
fn reorder_input(shape: &ConvShape, w: &[f32], precision: Precision) -> PwWeights {
    let k = shape.kernel_y * shape.kernel_x;
    let mut out = vec![0f32; k * shape.src_c * shape.dst_c];
    for dc in 0..shape.dst_c {
        for t in 0..k {
            for sc in 0..shape.src_c {
                out[(dc * k + t) * shape.src_c + sc] = w[(t * shape.src_c + sc) * shape.dst_c + dc];
            }
        }
    }
    pack(out, precision)
}

/// `[ky][kx][c]` to `[c][ky][kx]`.
fn reorder_depthwise(shape: &ConvShape, w: &[f32]) -> Vec<f32> {
    let k = shape.kernel_y * shape.kernel_x;
    let c_n = shape.dst_c;
    let mut out = vec![0f32; k * c_n];
    for c in 0..c_n {
        for t in 0..k {
            out[c * k + t] = w[t * c_n + c];
        }
    }
    out
}

/// `[src_c][dst_c]` to `[dst_c][src_c]`.
fn reorder_output(shape: &ConvShape, w: &[f32], precision: Precision) -> PwWeights {
    let mut out = vec![0f32; shape.src_c * shape.dst_c];
    for dc in 0..shape.dst_c {
        for sc in 0..shape.src_c {
            out[dc * shape.src_c + sc] = w[sc * shape.dst_c + dc];
        }
    }
    pack(out, precision)
}
