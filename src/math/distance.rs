//! # Distance Kernels
//!
//! The distance functions behind kNN: L1 (Manhattan), L2 (Euclidean),
//! squared L2, cosine, inner product, Hamming and Chi-squared. Millions of
//! evaluations happen per scan, so the contiguous-f32 kernels carry SIMD
//! paths (AVX2 on x86_64, NEON on aarch64) selected once at dispatch time;
//! everything else falls back to scalar loops.
//!
//! All kernels are pure functions over equal-length slices. The weighted
//! variants exist only as scalar loops: callers drop weights that are all
//! ≈ 1 before getting here (see [`weights_are_unit`]).
//!
//! Inner product is negated so every kernel is a "smaller is closer"
//! distance and the top-k heap never special-cases.

/// Distance kernel selector, carried by kNN predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distance {
    L1,
    L2,
    L2Squared,
    Cosine,
    InnerProduct,
    Hamming,
    ChiSquared,
}

impl Distance {
    pub fn name(&self) -> &'static str {
        match self {
            Distance::L1 => "L1",
            Distance::L2 => "L2",
            Distance::L2Squared => "L2SQUARED",
            Distance::Cosine => "COSINE",
            Distance::InnerProduct => "INNERPRODUCT",
            Distance::Hamming => "HAMMING",
            Distance::ChiSquared => "CHISQUARED",
        }
    }
}

pub type KernelF32 = fn(&[f32], &[f32]) -> f64;

pub fn l1_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += (x - y).abs();
    }
    sum
}

pub fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum
}

pub fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

pub fn cosine_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let norm_product = (norm_a * norm_b).sqrt();
    if norm_product == 0.0 {
        return 1.0;
    }
    1.0 - (dot / norm_product)
}

pub fn hamming_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut count = 0u32;
    for (x, y) in a.iter().zip(b.iter()) {
        if x != y {
            count += 1;
        }
    }
    count as f32
}

pub fn chi_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let denom = x + y;
        if denom != 0.0 {
            let diff = x - y;
            sum += (diff * diff) / denom;
        }
    }
    sum
}

// SAFETY: caller must ensure equal slice lengths; requires AVX2 + FMA,
// checked at dispatch time.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_fmadd_ps(diff, diff, sum);
        i += 8;
    }
    let mut result = horizontal_sum_avx2(sum);
    while i < n {
        let diff = a[i] - b[i];
        result += diff * diff;
        i += 1;
    }
    result
}

// SAFETY: as above.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn l1_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let mut i = 0;
    let sign_mask = _mm256_set1_ps(-0.0);
    let mut sum = _mm256_setzero_ps();
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_add_ps(sum, _mm256_andnot_ps(sign_mask, diff));
        i += 8;
    }
    let mut result = horizontal_sum_avx2(sum);
    while i < n {
        result += (a[i] - b[i]).abs();
        i += 1;
    }
    result
}

// SAFETY: as above.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        sum = _mm256_fmadd_ps(va, vb, sum);
        i += 8;
    }
    let mut result = horizontal_sum_avx2(sum);
    while i < n {
        result += a[i] * b[i];
        i += 1;
    }
    result
}

// SAFETY: as above.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn cosine_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let mut i = 0;
    let mut dot_sum = _mm256_setzero_ps();
    let mut norm_a_sum = _mm256_setzero_ps();
    let mut norm_b_sum = _mm256_setzero_ps();
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        dot_sum = _mm256_fmadd_ps(va, vb, dot_sum);
        norm_a_sum = _mm256_fmadd_ps(va, va, norm_a_sum);
        norm_b_sum = _mm256_fmadd_ps(vb, vb, norm_b_sum);
        i += 8;
    }
    let mut dot = horizontal_sum_avx2(dot_sum);
    let mut norm_a = horizontal_sum_avx2(norm_a_sum);
    let mut norm_b = horizontal_sum_avx2(norm_b_sum);
    while i < n {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
        i += 1;
    }
    let norm_product = (norm_a * norm_b).sqrt();
    if norm_product == 0.0 {
        return 1.0;
    }
    1.0 - (dot / norm_product)
}

/// # Safety
///
/// Callable only under the AVX2 target features enabled by the kernels
/// above; `v` must be a valid `__m256`.
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn horizontal_sum_avx2(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo, hi);
    let hi64 = _mm_movehl_ps(sum128, sum128);
    let sum64 = _mm_add_ps(sum128, hi64);
    let hi32 = _mm_shuffle_ps(sum64, sum64, 1);
    let sum32 = _mm_add_ss(sum64, hi32);
    _mm_cvtss_f32(sum32)
}

/// # Safety
///
/// Slices must have equal length; NEON is standard on all aarch64 CPUs.
#[cfg(target_arch = "aarch64")]
unsafe fn l2_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let mut i = 0;
    let mut sum = vdupq_n_f32(0.0);
    while i + 4 <= n {
        let va = vld1q_f32(a.as_ptr().add(i));
        let vb = vld1q_f32(b.as_ptr().add(i));
        let diff = vsubq_f32(va, vb);
        sum = vfmaq_f32(sum, diff, diff);
        i += 4;
    }
    let mut result = vaddvq_f32(sum);
    while i < n {
        let diff = a[i] - b[i];
        result += diff * diff;
        i += 1;
    }
    result
}

/// # Safety
///
/// Slices must have equal length; NEON is standard on all aarch64 CPUs.
#[cfg(target_arch = "aarch64")]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let mut i = 0;
    let mut sum = vdupq_n_f32(0.0);
    while i + 4 <= n {
        let va = vld1q_f32(a.as_ptr().add(i));
        let vb = vld1q_f32(b.as_ptr().add(i));
        sum = vfmaq_f32(sum, va, vb);
        i += 4;
    }
    let mut result = vaddvq_f32(sum);
    while i < n {
        result += a[i] * b[i];
        i += 1;
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

fn l1_dispatch(a: &[f32], b: &[f32]) -> f64 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l1_avx2(a, b) } as f64;
        }
    }
    l1_scalar(a, b) as f64
}

fn l2_squared_dispatch(a: &[f32], b: &[f32]) -> f64 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l2_squared_avx2(a, b) } as f64;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_squared_neon(a, b) } as f64;
    }
    #[allow(unreachable_code)]
    {
        l2_squared_scalar(a, b) as f64
    }
}

fn l2_dispatch(a: &[f32], b: &[f32]) -> f64 {
    l2_squared_dispatch(a, b).sqrt()
}

fn cosine_dispatch(a: &[f32], b: &[f32]) -> f64 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { cosine_avx2(a, b) } as f64;
        }
    }
    cosine_scalar(a, b) as f64
}

fn inner_product_dispatch(a: &[f32], b: &[f32]) -> f64 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return -(unsafe { dot_avx2(a, b) } as f64);
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return -(unsafe { dot_neon(a, b) } as f64);
    }
    #[allow(unreachable_code)]
    {
        -(dot_scalar(a, b) as f64)
    }
}

fn hamming_dispatch(a: &[f32], b: &[f32]) -> f64 {
    hamming_scalar(a, b) as f64
}

fn chi_squared_dispatch(a: &[f32], b: &[f32]) -> f64 {
    chi_squared_scalar(a, b) as f64
}

/// Selects the contiguous-f32 kernel for `metric`.
pub fn kernel_f32(metric: Distance) -> KernelF32 {
    match metric {
        Distance::L1 => l1_dispatch,
        Distance::L2 => l2_dispatch,
        Distance::L2Squared => l2_squared_dispatch,
        Distance::Cosine => cosine_dispatch,
        Distance::InnerProduct => inner_product_dispatch,
        Distance::Hamming => hamming_dispatch,
        Distance::ChiSquared => chi_squared_dispatch,
    }
}

/// Scalar kernels over f64 vectors.
pub fn distance_f64(metric: Distance, a: &[f64], b: &[f64]) -> f64 {
    match metric {
        Distance::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        Distance::L2 => distance_f64(Distance::L2Squared, a, b).sqrt(),
        Distance::L2Squared => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum(),
        Distance::Cosine => {
            let mut dot = 0.0;
            let mut norm_a = 0.0;
            let mut norm_b = 0.0;
            for (x, y) in a.iter().zip(b) {
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            let norm_product = (norm_a * norm_b).sqrt();
            if norm_product == 0.0 {
                1.0
            } else {
                1.0 - dot / norm_product
            }
        }
        Distance::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>(),
        Distance::Hamming => a.iter().zip(b).filter(|(x, y)| x != y).count() as f64,
        Distance::ChiSquared => a
            .iter()
            .zip(b)
            .filter(|(x, y)| **x + **y != 0.0)
            .map(|(x, y)| {
                let d = x - y;
                d * d / (x + y)
            })
            .sum(),
    }
}

/// Per-component weighted distance; scalar only.
pub fn weighted_f32(metric: Distance, a: &[f32], b: &[f32], w: &[f32]) -> f64 {
    match metric {
        Distance::L1 => a
            .iter()
            .zip(b)
            .zip(w)
            .map(|((x, y), wi)| (wi * (x - y).abs()) as f64)
            .sum(),
        Distance::L2 => weighted_f32(Distance::L2Squared, a, b, w).sqrt(),
        Distance::L2Squared => a
            .iter()
            .zip(b)
            .zip(w)
            .map(|((x, y), wi)| {
                let d = x - y;
                (wi * d * d) as f64
            })
            .sum(),
        Distance::Cosine => {
            let mut dot = 0.0f64;
            let mut norm_a = 0.0f64;
            let mut norm_b = 0.0f64;
            for ((x, y), wi) in a.iter().zip(b).zip(w) {
                dot += (wi * x * y) as f64;
                norm_a += (wi * x * x) as f64;
                norm_b += (wi * y * y) as f64;
            }
            let norm_product = (norm_a * norm_b).sqrt();
            if norm_product == 0.0 {
                1.0
            } else {
                1.0 - dot / norm_product
            }
        }
        Distance::InnerProduct => {
            -a.iter()
                .zip(b)
                .zip(w)
                .map(|((x, y), wi)| (wi * x * y) as f64)
                .sum::<f64>()
        }
        Distance::Hamming => a
            .iter()
            .zip(b)
            .zip(w)
            .filter(|((x, y), _)| x != y)
            .map(|(_, wi)| *wi as f64)
            .sum(),
        Distance::ChiSquared => a
            .iter()
            .zip(b)
            .zip(w)
            .filter(|((x, y), _)| **x + **y != 0.0)
            .map(|((x, y), wi)| {
                let d = x - y;
                (wi * d * d / (x + y)) as f64
            })
            .sum(),
    }
}

/// True when every weight is ≈ 1, in which case weighting is dropped.
pub fn weights_are_unit(w: &[f32]) -> bool {
    w.iter().all(|wi| (wi - 1.0).abs() < 1e-6)
}
