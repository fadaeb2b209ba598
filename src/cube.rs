//! 立方体の内側に入り込んだエンドエフェクタを押し返すばね壁．

use crate::{values, Meter, Newton, NewtonPerMeter, Triplet};

/// 最も近い壁とその壁までの符号付き距離．
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    /// 0:x, 1:y, 2:z
    pub axis: usize,
    /// 位置から壁の座標を引いた値．下側の壁なら正，上側の壁なら負になる．
    pub distance: Meter<f64>,
}

/// 軸に沿った直方体の境界．
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxBoundary {
    corner_a: Triplet<Meter<f64>>,
    corner_b: Triplet<Meter<f64>>,
    stiffness: NewtonPerMeter<f64>,
}

impl BoxBoundary {
    /// 2つの頂点とばね定数から境界を作る．頂点は軸ごとに小さい方が`corner_a`になるよう並べ替える．
    pub fn new(
        corner_a: Triplet<Meter<f64>>,
        corner_b: Triplet<Meter<f64>>,
        stiffness: NewtonPerMeter<f64>,
    ) -> BoxBoundary {
        let a = values(corner_a);
        let b = values(corner_b);
        let lower = Triplet::new(a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2]));
        let upper = Triplet::new(a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2]));
        BoxBoundary {
            corner_a: lower.map(Meter::new),
            corner_b: upper.map(Meter::new),
            stiffness,
        }
    }

    pub fn with_stiffness(mut self, stiffness: NewtonPerMeter<f64>) -> BoxBoundary {
        self.stiffness = stiffness;
        self
    }

    pub fn corner_a(&self) -> Triplet<Meter<f64>> {
        self.corner_a
    }

    pub fn corner_b(&self) -> Triplet<Meter<f64>> {
        self.corner_b
    }

    pub fn stiffness(&self) -> NewtonPerMeter<f64> {
        self.stiffness
    }

    /// `position`が全ての軸で境界の内側(境界上を除く)にあるか．
    pub fn contains(&self, position: Triplet<Meter<f64>>) -> bool {
        let (a, b, p) = self.coordinates(position);
        (0..3).all(|axis| a[axis] < p[axis] && p[axis] < b[axis])
    }

    /// 内側にあるとき，最も近い壁を返す．
    ///
    /// 距離が等しい壁が複数ある場合は，先に調べたもの(x,y,zの順，各軸では下側の壁が先)を採る．
    pub fn closest_face(&self, position: Triplet<Meter<f64>>) -> Option<Contact> {
        let (a, b, p) = self.coordinates(position);
        let mut closest = None;
        let mut dist = f64::INFINITY;
        for axis in 0..3 {
            if !(a[axis] < p[axis] && p[axis] < b[axis]) {
                return None;
            }
            for d in [p[axis] - a[axis], p[axis] - b[axis]] {
                if d.abs() < dist.abs() {
                    dist = d;
                    closest = Some(axis);
                }
            }
        }
        closest.map(|axis| Contact {
            axis,
            distance: Meter::new(dist),
        })
    }

    /// 最も近い壁の方向にだけ，めり込み量に比例した力を返す．外側なら0．
    pub fn force(&self, position: Triplet<Meter<f64>>) -> Triplet<Newton<f64>> {
        let mut force = [0.0; 3];
        if let Some(contact) = self.closest_face(position) {
            force[contact.axis] = -self.stiffness.value_unsafe * contact.distance.value_unsafe;
        }
        Triplet::new(force[0], force[1], force[2]).map(Newton::new)
    }

    fn coordinates(&self, position: Triplet<Meter<f64>>) -> ([f64; 3], [f64; 3], [f64; 3]) {
        (values(self.corner_a), values(self.corner_b), values(position))
    }
}

impl Default for BoxBoundary {
    /// 一辺6cmの立方体．作業空間の中心付近に置く．
    fn default() -> Self {
        BoxBoundary::new(
            Triplet::new(-0.030, -0.030, 0.095).map(Meter::new),
            Triplet::new(0.030, 0.030, 0.155).map(Meter::new),
            NewtonPerMeter::<f64>::new(1000.0),
        )
    }
}
