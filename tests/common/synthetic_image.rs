use warpc::Tensor;

/// Generates a simple high-contrast checkerboard image.
pub fn checkerboard_u8(width: usize, height: usize, cell: usize) -> Vec<u8> {
    assert!(width > 0 && height > 0, "image dimensions must be positive");
    assert!(cell > 0, "cell size must be positive");

    let mut img = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let sum = x / cell + y / cell;
            img[y * width + x] = if sum % 2 == 0 { 32 } else { 220 };
        }
    }
    img
}

/// Smooth RGB texture with distinct gradients per channel. Values sit at
/// half-integers so that truncation to the u8 range is stable under tiny
/// sampling offsets.
pub fn smooth_rgb(batch: usize, height: usize, width: usize) -> Tensor {
    let mut t = Tensor::zeros(batch, 3, height, width);
    for b in 0..batch {
        for y in 0..height {
            for x in 0..width {
                let (xf, yf) = (x as f32, y as f32);
                let values = [
                    128.0 + 90.0 * (0.21 * xf + 0.05 * b as f32).sin(),
                    128.0 + 90.0 * (0.17 * yf).cos(),
                    40.0 + 2.0 * (xf + yf),
                ];
                for (c, v) in values.into_iter().enumerate() {
                    t.set(b, c, y, x, v.floor() + 0.5);
                }
            }
        }
    }
    t
}

/// Checkerboard replicated on three channels.
pub fn checkerboard_rgb(height: usize, width: usize, cell: usize) -> Tensor {
    let plane: Vec<f32> = checkerboard_u8(width, height, cell)
        .into_iter()
        .map(f32::from)
        .collect();
    let data = [plane.as_slice(); 3].concat();
    Tensor::from_vec(1, 3, height, width, data).expect("checkerboard shape")
}
