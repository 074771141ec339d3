//! 身份映射相关的表定义
//!
//! 正向 (真实 -> 虚拟) 与反向 (虚拟 -> 真实) 分开存放，
//! 这样绑定操作可以只改写其中一侧。

pub mod forward {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "idmap_forward")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub native_id: String,
        pub synthetic_id: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod reverse {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "idmap_reverse")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub synthetic_id: i64,
        pub native_id: String,
        /// 通过绑定指令从哪个虚拟值迁移而来
        pub rebound_from: Option<i64>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod pair_forward {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "idmap_pair_forward")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub container_native: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub member_native: String,
        pub container_synthetic: i64,
        pub member_synthetic: i64,
        /// 微秒时间戳
        pub bound_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod pair_reverse {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "idmap_pair_reverse")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub container_synthetic: i64,
        #[sea_orm(primary_key, auto_increment = false)]
        pub member_synthetic: i64,
        pub container_native: String,
        pub member_native: String,
        pub bound_at: i64,
        pub rebound_from_container: Option<i64>,
        pub rebound_from_member: Option<i64>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod attribute {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "idmap_attribute")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub subject: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub field: String,
        pub value: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
