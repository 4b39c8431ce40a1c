// Integration tests for .npy persistence
//
// Round-trips go through real files in a temporary directory.

use std::fs;

use kestrel::prelude::*;

#[test]
fn test_round_trip_every_dtype() -> kestrel::Result<()> {
    let dir = tempfile::tempdir()?;
    let arrays = [
        Array::arange((2, 3), DType::F32)?,
        Array::from_vec(vec![0.1f64, -2.5, 1e300], 3)?,
        Array::from_vec(vec![-7i32, 0, 42, 1, 2, 3, 4, 5], (2, 2, 2))?,
        Array::scalar(3.5, DType::F64)?,
    ];
    for (i, array) in arrays.iter().enumerate() {
        let path = dir.path().join(format!("a{i}.npy"));
        npy::save(&path, array)?;
        let loaded = npy::load(&path)?;
        assert_eq!(loaded.dtype(), array.dtype());
        assert_eq!(loaded.shape(), array.shape());
        assert!(loaded.equals(array)?);
    }
    Ok(())
}

#[test]
fn test_fortran_file_loads_as_row_major() -> kestrel::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fortran.npy");

    // a 2x3x2 array of 0..12 written column-major, as numpy does for
    // np.asfortranarray(np.arange(12.).reshape(2, 3, 2))
    let row_major = Array::arange((2, 3, 2), DType::F64)?;
    let mut payload = Vec::new();
    for k in 0..2 {
        for j in 0..3 {
            for i in 0..2 {
                payload.extend_from_slice(&row_major.get(&[i, j, k])?.to_le_bytes());
            }
        }
    }
    let mut header = String::from("{'descr': '<f8', 'fortran_order': True, 'shape': (2, 3, 2), }");
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&payload);
    fs::write(&path, bytes)?;

    let loaded = npy::load(&path)?;
    assert_eq!(loaded.dims(), &[2, 3, 2]);
    assert!(loaded.equals(&row_major)?);
    Ok(())
}

#[test]
fn test_unsupported_descr_is_rejected() -> kestrel::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big_endian.npy");
    let header = "{'descr': '>f8', 'fortran_order': False, 'shape': (1,), }\n";
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&[0; 8]);
    fs::write(&path, bytes)?;
    assert!(matches!(npy::load(&path), Err(Error::Npy(_))));
    assert!(matches!(
        npy::load(dir.path().join("missing.npy")),
        Err(Error::Io(_))
    ));
    Ok(())
}

#[test]
fn test_overflowing_shape_is_rejected() {
    let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (4611686018427387904,), }\n";
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&[0; 8]);
    assert!(matches!(npy::from_bytes(&bytes), Err(Error::Npy(_))));

    let header = "{'descr': '<f4', 'fortran_order': True, 'shape': (4294967296, 4294967296, 2), }\n";
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    assert!(matches!(npy::from_bytes(&bytes), Err(Error::Npy(_))));
}

#[test]
fn test_tensor_checkpoint_directory() -> kestrel::Result<()> {
    let dir = tempfile::tempdir()?;
    let checkpoint = dir.path().join("epoch_3");
    random::set_seed(11);
    let params = vec![
        Tensor::new((4, 3), Init::gaussian(1.0), DType::F32)?,
        Tensor::new(3, Init::uniform(0.5), DType::F64)?,
    ];
    npy::save_tensors(&checkpoint, &params)?;
    assert!(checkpoint.join("param_0.npy").exists());
    assert!(checkpoint.join("param_1.npy").exists());

    let restored = vec![
        Tensor::zeros((4, 3), DType::F32)?,
        Tensor::zeros(3, DType::F64)?,
    ];
    npy::load_tensors(&checkpoint, &restored)?;
    for (p, r) in params.iter().zip(&restored) {
        assert!(r.w().equals(p.w())?);
    }

    let wrong = vec![Tensor::zeros((3, 4), DType::F32)?];
    assert!(matches!(
        npy::load_tensors(&checkpoint, &wrong),
        Err(Error::ShapeMismatch { .. })
    ));

    let single = checkpoint.join("param_1.npy");
    let t = npy::load_tensor(&single)?;
    assert_eq!(t.dims(), &[3]);
    assert_eq!(t.dw().sum()?, 0.0);
    npy::save_tensor(dir.path().join("copy.npy"), &t)?;
    Ok(())
}
